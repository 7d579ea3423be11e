use crate::buffer_pool::BufferPool;
use crate::configuration::QuicConfiguration;
use crate::error::{ConnectionError, DispatchError, TransportError};
use crate::header::ConnectionId;
use crate::io_queue::{IoQueue, IoQueuePool};
use crate::pipe::{self, Pipe, PipeMetrics, PipeReader, PipeWriter};
use crate::signal::Signal;
use crate::socket::ConnectionSocket;
use crate::sync::lock;
use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Active,
    Draining,
    Closed,
}

/// Receives every started connection and drives the application protocol on it.
pub trait ConnectionDispatcher: Send + Sync + 'static {
    fn on_connection(&self, connection: ConnectionContext) -> Result<(), DispatchError>;
}

impl<F> ConnectionDispatcher for F
where
    F: Fn(ConnectionContext) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    fn on_connection(&self, connection: ConnectionContext) -> Result<(), DispatchError> {
        self(connection)
    }
}

/// Application side of a connection.
#[derive(Debug)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Bytes received from the peer.
    pub input: PipeReader,
    /// Bytes to send to the peer.
    pub output: PipeWriter,
    pub connection: Arc<QuicConnection>,
}

impl ConnectionContext {
    pub fn abort(&self) {
        self.connection.abort();
    }

    pub async fn closed(&self) {
        self.connection.closed().wait().await;
    }
}

#[derive(Debug)]
struct PipeEnds {
    input: PipeWriter,
    output: PipeReader,
    application_input: PipeReader,
    application_output: PipeWriter,
}

/// Duplex data path between one socket and the application.
///
/// Two loops run per connection: the receive loop fills the inbound pipe from
/// the socket, the send loop drains the outbound pipe into the socket. When
/// either finishes the socket is disposed so the other one stops too.
pub struct QuicConnection {
    connection_id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    socket: Mutex<Option<Arc<dyn ConnectionSocket>>>,
    queues: Arc<IoQueuePool>,
    queue_index: usize,
    minimum_receive_size: usize,
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    ends: Mutex<Option<PipeEnds>>,
    aborted: Mutex<bool>,
    total_bytes_written: AtomicU64,
    state: Mutex<ConnectionState>,
    closed: Arc<Signal>,
}

impl std::fmt::Debug for QuicConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicConnection")
            .field("connection_id", &self.connection_id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("queue_index", &self.queue_index)
            .field("state", &self.state())
            .finish()
    }
}

impl QuicConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: ConnectionId,
        socket: Arc<dyn ConnectionSocket>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        queues: Arc<IoQueuePool>,
        queue_index: usize,
        configuration: &QuicConfiguration,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let options = configuration.pipe_options();
        let (input, application_input) = pipe::pipe(options, pool.clone());
        let (application_output, output) = pipe::pipe(options, pool);

        Arc::new(Self {
            connection_id,
            local_addr,
            remote_addr,
            socket: Mutex::new(Some(socket)),
            queues,
            queue_index,
            minimum_receive_size: configuration.minimum_receive_size(),
            inbound: input.pipe().clone(),
            outbound: output.pipe().clone(),
            ends: Mutex::new(Some(PipeEnds {
                input,
                output,
                application_input,
                application_output,
            })),
            aborted: Mutex::new(false),
            total_bytes_written: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Created),
            closed: Arc::new(Signal::new()),
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_aborted(&self) -> bool {
        *lock(&self.aborted)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Relaxed)
    }

    pub fn inbound_metrics(&self) -> PipeMetrics {
        self.inbound.metrics()
    }

    pub fn outbound_metrics(&self) -> PipeMetrics {
        self.outbound.metrics()
    }

    /// Fired once, after both loops ended and the socket was released.
    pub fn closed(&self) -> &Arc<Signal> {
        &self.closed
    }

    fn queue(&self) -> &IoQueue {
        self.queues.get(self.queue_index)
    }

    fn socket(&self) -> Option<Arc<dyn ConnectionSocket>> {
        lock(&self.socket).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Hands the application ends to `dispatcher` and launches the pipeline.
    pub fn start(
        self: &Arc<Self>,
        dispatcher: &dyn ConnectionDispatcher,
    ) -> Result<JoinHandle<()>, TransportError> {
        let PipeEnds {
            input,
            output,
            application_input,
            application_output,
        } = lock(&self.ends).take().ok_or(TransportError::AlreadyStarted)?;

        let context = ConnectionContext {
            connection_id: self.connection_id,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            input: application_input,
            output: application_output,
            connection: self.clone(),
        };
        if let Err(err) = dispatcher.on_connection(context) {
            if let Some(socket) = lock(&self.socket).take() {
                socket.dispose();
            }
            self.set_state(ConnectionState::Closed);
            self.closed.fire();
            return Err(TransportError::Dispatch(err));
        }

        self.set_state(ConnectionState::Active);
        let connection = self.clone();
        Ok(self
            .queue()
            .spawn(async move { connection.run(input, output).await }))
    }

    async fn run(self: Arc<Self>, input: PipeWriter, output: PipeReader) {
        let Some(socket) = self.socket() else {
            return;
        };

        let mut receive = self.queue().spawn({
            let connection = self.clone();
            let socket = socket.clone();
            async move { connection.do_receive(socket, input).await }
        });
        let mut send = self.queue().spawn({
            let connection = self.clone();
            let socket = socket.clone();
            async move { connection.do_send(socket, output).await }
        });

        let mut received = None;
        let mut sent = None;
        tokio::select! {
            r = &mut receive => received = Some(r),
            r = &mut send => sent = Some(r),
        }

        // Whichever side is still running is not waited on gracefully.
        self.set_state(ConnectionState::Draining);
        trace!(connection_id = %self.connection_id, "connection draining");
        socket.dispose();
        self.outbound.cancel_pending_read();

        let received = match received {
            Some(r) => r,
            None => receive.await,
        };
        let sent = match sent {
            Some(r) => r,
            None => send.await,
        };

        if let Err(err) = received {
            warn!(connection_id = %self.connection_id, operation = "receive", error = %err, "receive loop did not complete");
        }
        match sent {
            Ok((mut output, error)) => output.complete(error),
            Err(err) => {
                warn!(connection_id = %self.connection_id, operation = "send", error = %err, "send loop did not complete")
            }
        }

        drop(socket);
        lock(&self.socket).take();
        self.set_state(ConnectionState::Closed);
        debug!(
            connection_id = %self.connection_id,
            bytes_written = self.total_bytes_written(),
            "connection closed"
        );

        let closed = self.closed.clone();
        tokio::spawn(async move {
            closed.fire();
        });
    }

    async fn do_receive(&self, socket: Arc<dyn ConnectionSocket>, mut input: PipeWriter) {
        let error = match self.process_receives(&*socket, &mut input).await {
            Ok(()) => None,
            Err(err) => self.receive_error(err),
        };
        let error = match error {
            None if self.is_aborted() => Some(ConnectionError::aborted()),
            error => error,
        };
        if let Some(err) = &error {
            debug!(connection_id = %self.connection_id, operation = "receive", error = %err, "receive loop ended");
        }
        input.complete(error);
    }

    async fn process_receives(
        &self,
        socket: &dyn ConnectionSocket,
        input: &mut PipeWriter,
    ) -> io::Result<()> {
        loop {
            let buffer = input.get_memory(self.minimum_receive_size);
            let received = socket.recv(buffer).await?;
            if received == 0 {
                trace!(connection_id = %self.connection_id, "peer closed the connection");
                break;
            }
            input.advance(received);

            let flush = input
                .flush()
                .await
                .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
            if flush.is_completed {
                break;
            }
        }
        Ok(())
    }

    fn receive_error(&self, err: io::Error) -> Option<ConnectionError> {
        match err.kind() {
            ErrorKind::ConnectionReset => Some(ConnectionError::Reset(err)),
            ErrorKind::ConnectionAborted | ErrorKind::InvalidInput | ErrorKind::Interrupted => {
                match self.is_aborted() {
                    true => None,
                    false => Some(ConnectionError::Aborted(err.to_string())),
                }
            }
            _ => Some(ConnectionError::Io(err)),
        }
    }

    async fn do_send(
        &self,
        socket: Arc<dyn ConnectionSocket>,
        mut output: PipeReader,
    ) -> (PipeReader, Option<ConnectionError>) {
        let error = match self.process_sends(&*socket, &mut output).await {
            Ok(()) => None,
            Err(err) => match err.kind() {
                ErrorKind::ConnectionAborted => None,
                ErrorKind::NotConnected | ErrorKind::BrokenPipe if self.is_aborted() => None,
                _ => Some(ConnectionError::Io(err)),
            },
        };
        if let Some(err) = &error {
            debug!(connection_id = %self.connection_id, operation = "send", error = %err, "send loop ended");
        }
        self.shutdown();
        (output, error)
    }

    async fn process_sends(
        &self,
        socket: &dyn ConnectionSocket,
        output: &mut PipeReader,
    ) -> io::Result<()> {
        let mut regions: Vec<Bytes> = Vec::new();
        loop {
            let result = output
                .read()
                .await
                .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
            if result.is_canceled {
                break;
            }

            if !result.is_empty() {
                output.regions(&mut regions);
                let len: usize = regions.iter().map(Bytes::len).sum();
                let written = match regions.as_slice() {
                    [region] => socket.send(region).await?,
                    regions => socket.send_vectored(regions).await?,
                };
                regions.clear();

                self.total_bytes_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                output.advance(len);
            }

            if result.is_completed {
                break;
            }
        }
        Ok(())
    }

    /// Shuts the socket down once, no matter how many callers race here.
    pub fn shutdown(&self) {
        let mut aborted = lock(&self.aborted);
        if *aborted {
            return;
        }
        *aborted = true;

        if let Some(socket) = self.socket() {
            if let Err(err) = socket.shutdown() {
                trace!(connection_id = %self.connection_id, error = %err, "socket shutdown failed");
            }
        }
    }

    /// Shuts the socket down and stops the send loop waiting for output.
    pub fn abort(&self) {
        self.shutdown();
        self.outbound.cancel_pending_read();
    }
}
