use crate::buffer_pool::BufferPool;
use crate::configuration::{EndpointInformation, ListenMode, QuicConfiguration};
use crate::connection::{ConnectionDispatcher, QuicConnection};
use crate::error::TransportError;
use crate::header::ConnectionId;
use crate::io_queue::IoQueuePool;
use crate::packet::Packet;
use crate::routing::ConnectionTable;
use crate::signal::Signal;
use crate::socket::{ConnectionSocket, DatagramSocket, StreamSocket};
use crate::sync::{lock, read, write};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::any::Any;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Host hook asked to shut the application down after a fatal transport failure.
pub trait ApplicationLifetime: Send + Sync + 'static {
    fn stop_application(&self);
}

impl<F> ApplicationLifetime for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn stop_application(&self) {
        self()
    }
}

const CONNECTION_ID_LEN: usize = 8;

#[derive(Debug)]
struct Route {
    connection: Arc<QuicConnection>,
    /// Inbound datagram channel, datagram mode only.
    datagrams: Option<mpsc::Sender<Bytes>>,
}

#[derive(Debug)]
struct Listener {
    disposed: Arc<Signal>,
    task: JoinHandle<()>,
}

struct TransportInner {
    endpoint: Arc<RwLock<EndpointInformation>>,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    lifetime: Arc<dyn ApplicationLifetime>,
    configuration: QuicConfiguration,
    connections: ConnectionTable<Route>,
    queues: Arc<IoQueuePool>,
    pool: Arc<BufferPool>,
    unbinding: AtomicBool,
    fatal: Mutex<Option<TransportError>>,
}

/// Listening side of the transport: owns the listening socket, routes inbound
/// traffic to connections and starts a pipeline for every new one.
pub struct QuicTransport {
    inner: Arc<TransportInner>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl QuicTransport {
    pub fn new(
        endpoint: Arc<RwLock<EndpointInformation>>,
        dispatcher: Arc<dyn ConnectionDispatcher>,
        lifetime: Arc<dyn ApplicationLifetime>,
        configuration: QuicConfiguration,
    ) -> io::Result<Self> {
        let queues = IoQueuePool::new(
            configuration.io_queue_count,
            configuration.inline_completions,
        )?;
        Ok(Self {
            inner: Arc::new(TransportInner {
                endpoint,
                dispatcher,
                lifetime,
                configuration,
                connections: ConnectionTable::new(),
                queues: Arc::new(queues),
                pool: Arc::new(BufferPool::default()),
                unbinding: AtomicBool::new(false),
                fatal: Mutex::new(None),
            }),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> EndpointInformation {
        read(&self.inner.endpoint).clone()
    }

    /// Number of live connections in the routing table.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn io_queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    /// Binds the listening socket and starts the accept loop in the background.
    pub async fn bind(&self) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Err(TransportError::AlreadyBound);
        }

        let inner = &self.inner;
        let addr = read(&inner.endpoint).addr;
        let disposed = Arc::new(Signal::new());

        let (local_addr, accept) = match inner.configuration.mode {
            ListenMode::Datagram => {
                let socket = bind_socket(addr, Type::DGRAM, Protocol::UDP)?;
                let channel = Arc::new(UdpSocket::from_std(socket.into())?);
                let local_addr = channel.local_addr()?;
                let accept = tokio::spawn(
                    inner
                        .clone()
                        .run_datagram_loop(channel, local_addr, disposed.clone()),
                );
                (local_addr, accept)
            }
            ListenMode::Stream => {
                let socket = bind_socket(addr, Type::STREAM, Protocol::TCP)?;
                let backlog = i32::try_from(inner.configuration.listen_backlog).unwrap_or(i32::MAX);
                socket.listen(backlog)?;
                let tcp = TcpListener::from_std(socket.into())?;
                let local_addr = tcp.local_addr()?;
                let accept =
                    tokio::spawn(inner.clone().run_stream_loop(tcp, disposed.clone()));
                (local_addr, accept)
            }
        };

        if addr.port() == 0 {
            write(&inner.endpoint).addr = local_addr;
        }
        debug!(addr = %local_addr, mode = ?inner.configuration.mode, "transport bound");

        let task = tokio::spawn(inner.clone().supervise(accept));
        *listener = Some(Listener { disposed, task });
        Ok(())
    }

    /// Stops accepting. Returns, once, the fatal error that ended the accept loop.
    pub async fn unbind(&self) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().await;
        let Some(Listener { disposed, task }) = listener.take() else {
            return Ok(());
        };

        let inner = &self.inner;
        inner.unbinding.store(true, Ordering::SeqCst);
        disposed.fire();
        if let Err(err) = task.await {
            warn!(error = %err, "accept loop supervisor did not complete");
        }
        inner.unbinding.store(false, Ordering::SeqCst);
        debug!("transport unbound");

        match lock(&inner.fatal).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unbinds, aborts every live connection and releases the buffer pool.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let result = self.unbind().await;
        let routes = self.inner.connections.snapshot();
        for route in &routes {
            route.connection.abort();
        }
        if !routes.is_empty() {
            debug!(connections = routes.len(), "aborted live connections");
        }
        self.inner.pool.dispose();
        result
    }
}

impl TransportInner {
    async fn supervise(self: Arc<Self>, accept: JoinHandle<Result<(), TransportError>>) {
        let result = match accept.await {
            Ok(result) => result,
            Err(err) => Err(TransportError::Panic(join_error_message(err))),
        };
        let Err(err) = result else {
            return;
        };

        if self.unbinding.load(Ordering::SeqCst) {
            debug!(error = %err, "accept loop failed while unbinding");
            return;
        }
        error!(critical = true, operation = "accept", error = %err, "unexpected failure in the accept loop");
        {
            let mut fatal = lock(&self.fatal);
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.lifetime.stop_application();
    }

    /// Returns whether the accept loop should keep going after `err`.
    fn socket_error(&self, err: io::Error, operation: &'static str) -> bool {
        if err.kind() == ErrorKind::ConnectionReset {
            debug!(operation, error = %err, "connection reset");
            return true;
        }
        if self.unbinding.load(Ordering::SeqCst) {
            return false;
        }
        error!(operation, error = %err, "socket error");
        true
    }

    async fn run_datagram_loop(
        self: Arc<Self>,
        channel: Arc<UdpSocket>,
        local_addr: SocketAddr,
        disposed: Arc<Signal>,
    ) -> Result<(), TransportError> {
        let mut buf = vec![0u8; self.configuration.max_datagram_size.max(1)];
        loop {
            let (size, peer) = tokio::select! {
                biased;
                _ = disposed.wait() => return Ok(()),
                r = channel.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(err) => match self.socket_error(err, "receive") {
                        true => continue,
                        false => return Ok(()),
                    },
                },
            };
            if size == 0 {
                continue;
            }

            let datagram = Bytes::copy_from_slice(&buf[..size]);
            let packet = match Packet::parse(&datagram) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(peer = %peer, error = %err, "dropping undecodable datagram");
                    continue;
                }
            };
            trace!(peer = %peer, "rcv {}", packet);

            let key = packet
                .destination_connection_id()
                .copied()
                .unwrap_or_default();
            let (route, created) = self.connections.get_or_insert_with(key, || {
                let (socket, datagrams) = DatagramSocket::new(
                    channel.clone(),
                    peer,
                    self.configuration.max_datagram_size,
                    self.configuration.datagram_channel_capacity,
                );
                self.new_route(key, Arc::new(socket), local_addr, peer, Some(datagrams))
            });
            if created {
                self.start_route(key, &route)?;
            }

            if let Some(datagrams) = &route.datagrams {
                match datagrams.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(connection_id = %key, peer = %peer, "receive queue full, dropping datagram")
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!(connection_id = %key, peer = %peer, "connection closed, dropping datagram")
                    }
                }
            }
        }
    }

    async fn run_stream_loop(
        self: Arc<Self>,
        listener: TcpListener,
        disposed: Arc<Signal>,
    ) -> Result<(), TransportError> {
        let listener_addr = listener.local_addr()?;
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = disposed.wait() => return Ok(()),
                r = listener.accept() => match r {
                    Ok(r) => r,
                    Err(err) => match self.socket_error(err, "accept") {
                        true => continue,
                        false => return Ok(()),
                    },
                },
            };

            let no_delay = read(&self.endpoint).no_delay;
            if let Err(err) = stream.set_nodelay(no_delay) {
                debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
            }
            // The accepted socket can already be reset by the peer.
            let local_addr = stream.local_addr().unwrap_or(listener_addr);
            let key = ConnectionId::random(CONNECTION_ID_LEN);

            let (route, created) = self.connections.get_or_insert_with(key, || {
                let socket = StreamSocket::new(stream);
                self.new_route(key, Arc::new(socket), local_addr, peer, None)
            });
            match created {
                true => self.start_route(key, &route)?,
                false => warn!(connection_id = %key, peer = %peer, "connection id collision, connection dropped"),
            }
        }
    }

    fn new_route(
        &self,
        key: ConnectionId,
        socket: Arc<dyn ConnectionSocket>,
        local_addr: SocketAddr,
        peer: SocketAddr,
        datagrams: Option<mpsc::Sender<Bytes>>,
    ) -> Arc<Route> {
        let queue_index = self.queues.next_index();
        let connection = QuicConnection::new(
            key,
            socket,
            local_addr,
            peer,
            self.queues.clone(),
            queue_index,
            &self.configuration,
            self.pool.clone(),
        );
        Arc::new(Route {
            connection,
            datagrams,
        })
    }

    /// Hands a freshly inserted route to the dispatcher. Runs outside the
    /// routing table lock, since the dispatcher may call back into the transport.
    fn start_route(
        self: &Arc<Self>,
        key: ConnectionId,
        route: &Arc<Route>,
    ) -> Result<(), TransportError> {
        let connection = &route.connection;
        if let Err(err) = connection.start(&*self.dispatcher) {
            self.connections.remove_if_same(&key, route);
            return Err(err);
        }
        debug!(
            connection_id = %key,
            peer = %connection.remote_addr(),
            queue = connection.queue_index(),
            "connection started"
        );
        self.remove_when_closed(key, route.clone());
        Ok(())
    }

    fn remove_when_closed(self: &Arc<Self>, key: ConnectionId, route: Arc<Route>) {
        let transport: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            route.connection.closed().wait().await;
            if let Some(transport) = transport.upgrade() {
                if transport.connections.remove_if_same(&key, &route) {
                    trace!(connection_id = %key, "connection removed");
                }
            }
        });
    }
}

fn bind_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    // An unspecified IPv6 address accepts IPv4 peers too.
    if let SocketAddr::V6(v6) = addr {
        if v6.ip().is_unspecified() {
            socket.set_only_v6(false)?;
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).map_err(|source| match source.kind() {
        ErrorKind::AddrInUse => TransportError::AddressInUse { addr, source },
        _ => TransportError::Io(source),
    })?;
    Ok(socket)
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "unknown panic".to_owned(),
    }
}
