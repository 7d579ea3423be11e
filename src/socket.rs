use crate::signal::Signal;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Error, ErrorKind, IoSlice, Result};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

fn disposed_error() -> Error {
    Error::new(ErrorKind::ConnectionAborted, "socket disposed")
}

/// Byte transport underneath a connection pipeline.
///
/// `recv` and `send` may run concurrently from two tasks. `dispose` must make
/// any pending or future `recv`/`send` fail promptly.
#[async_trait]
pub trait ConnectionSocket: Send + Sync + 'static {
    /// Reads into `buf`; `Ok(0)` means the peer closed gracefully.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole of `buf`.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Writes every region, in order.
    async fn send_vectored(&self, regions: &[Bytes]) -> Result<usize> {
        let mut total = 0;
        for region in regions {
            total += self.send(region).await?;
        }
        Ok(total)
    }

    /// Graceful bidirectional shutdown.
    fn shutdown(&self) -> Result<()>;

    /// Forcibly closes the socket, unblocking pending operations.
    fn dispose(&self);
}

/// A connected stream socket (the connection-oriented accept path).
#[derive(Debug)]
pub struct StreamSocket {
    stream: TcpStream,
    disposed: Signal,
}

impl StreamSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            disposed: Signal::new(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr()
    }

    async fn writable(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.disposed.wait() => Err(disposed_error()),
            r = self.stream.writable() => r,
        }
    }
}

#[async_trait]
impl ConnectionSocket for StreamSocket {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            tokio::select! {
                biased;
                _ = self.disposed.wait() => return Err(disposed_error()),
                r = self.stream.readable() => r?,
            }
            match self.stream.try_read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                r => return r,
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            self.writable().await?;
            match self.stream.try_write(&buf[written..]) {
                Ok(0) => return Err(Error::new(ErrorKind::WriteZero, "socket wrote 0 bytes")),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    async fn send_vectored(&self, regions: &[Bytes]) -> Result<usize> {
        let total: usize = regions.iter().map(Bytes::len).sum();
        let written = loop {
            self.writable().await?;
            let slices: Vec<IoSlice<'_>> = regions.iter().map(|r| IoSlice::new(r)).collect();
            match self.stream.try_write_vectored(&slices) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                r => break r?,
            }
        };

        // Finish a partial vectored write region by region.
        let mut skip = written;
        for region in regions {
            if skip >= region.len() {
                skip -= region.len();
                continue;
            }
            self.send(&region[skip..]).await?;
            skip = 0;
        }
        Ok(total)
    }

    fn shutdown(&self) -> Result<()> {
        socket2::SockRef::from(&self.stream).shutdown(Shutdown::Both)
    }

    fn dispose(&self) {
        if self.disposed.fire() {
            let _ = socket2::SockRef::from(&self.stream).shutdown(Shutdown::Both);
        }
    }
}

#[derive(Debug)]
struct DatagramInbound {
    datagrams: mpsc::Receiver<Bytes>,
    pending: Option<Bytes>,
}

/// A virtual connection over a shared UDP socket: inbound datagrams are fed
/// by the transport's demultiplexer, outbound bytes are sent to one peer.
#[derive(Debug)]
pub struct DatagramSocket {
    channel: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    max_datagram_size: usize,
    inbound: Mutex<DatagramInbound>,
    closed: Signal,
    disposed: Signal,
}

impl DatagramSocket {
    /// Returns the socket and the sender the demultiplexer delivers datagrams to.
    pub fn new(
        channel: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        max_datagram_size: usize,
        capacity: usize,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let socket = Self {
            channel,
            remote_addr,
            max_datagram_size: max_datagram_size.max(1),
            inbound: Mutex::new(DatagramInbound {
                datagrams: rx,
                pending: None,
            }),
            closed: Signal::new(),
            disposed: Signal::new(),
        };
        (socket, tx)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl ConnectionSocket for DatagramSocket {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.disposed.is_fired() {
            return Err(disposed_error());
        }
        let mut inbound = self.inbound.lock().await;
        let mut datagram = match inbound.pending.take() {
            Some(datagram) => datagram,
            None => {
                tokio::select! {
                    biased;
                    _ = self.disposed.wait() => return Err(disposed_error()),
                    _ = self.closed.wait() => return Ok(0),
                    d = inbound.datagrams.recv() => match d {
                        Some(datagram) => datagram,
                        None => return Ok(0),
                    },
                }
            }
        };

        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        if n < datagram.len() {
            inbound.pending = Some(datagram.split_off(n));
        }
        Ok(n)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.is_fired() {
            return Err(Error::new(ErrorKind::NotConnected, "socket shut down"));
        }
        for datagram in buf.chunks(self.max_datagram_size) {
            tokio::select! {
                biased;
                _ = self.disposed.wait() => return Err(disposed_error()),
                r = self.channel.send_to(datagram, self.remote_addr) => r?,
            };
        }
        Ok(buf.len())
    }

    fn shutdown(&self) -> Result<()> {
        self.closed.fire();
        Ok(())
    }

    fn dispose(&self) {
        self.closed.fire();
        self.disposed.fire();
    }
}
