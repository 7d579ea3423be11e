use crate::pipe::PipeOptions;
use std::net::SocketAddr;

/// Segment size the I/O buffers are sized around.
pub const PREFERRED_SEGMENT_SIZE: usize = 4096;
pub const MAX_IO_QUEUE_COUNT: usize = 16;

const DEFAULT_MAX_DATAGRAM_SIZE: usize = 4096;
const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 1024 * 1024;
const DEFAULT_RESUME_WRITER_THRESHOLD: usize = DEFAULT_PAUSE_WRITER_THRESHOLD / 2;
const DEFAULT_DATAGRAM_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_LISTEN_BACKLOG: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Connectionless: datagrams are demultiplexed by destination connection id.
    Datagram,
    /// Connection-oriented: every accepted stream is its own connection.
    Stream,
}

/// Options for the QUIC transport
#[derive(Debug, Clone)]
pub struct QuicConfiguration {
    pub mode: ListenMode,
    /// Number of I/O queues connections are spread over, round-robin.
    /// 0 runs every connection on the ambient runtime.
    /// Default: the available parallelism, clamped between 1 and 16.
    pub io_queue_count: usize,
    /// Whether connection tasks run on the ambient Tokio runtime rather than on
    /// `io_queue_count` dedicated single-threaded runtimes. The multi-threaded
    /// runtime already dispatches socket readiness onto its worker pool.
    /// Default: true
    pub inline_completions: bool,
    /// Largest datagram received or sent by the transport. Default: 4096 bytes
    pub max_datagram_size: usize,
    /// Inbound bytes buffered for the application before the receive loop
    /// stops reading from the socket. Default: 1 MiB
    pub pause_writer_threshold: usize,
    /// Buffered inbound bytes at which a paused receive loop resumes. Default: 512 KiB
    pub resume_writer_threshold: usize,
    /// Datagrams queued per connection between the demultiplexer and the
    /// connection's receive loop. Default: 256
    pub datagram_channel_capacity: usize,
    /// Backlog of the listening socket in stream mode. Default: 512
    pub listen_backlog: u32,
}

impl QuicConfiguration {
    pub(crate) fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            pause_writer_threshold: self.pause_writer_threshold,
            resume_writer_threshold: self.resume_writer_threshold,
            minimum_segment_size: PREFERRED_SEGMENT_SIZE,
        }
    }

    pub(crate) fn minimum_receive_size(&self) -> usize {
        PREFERRED_SEGMENT_SIZE / 2
    }
}

pub fn default_io_queue_count() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
        .clamp(1, MAX_IO_QUEUE_COUNT)
}

impl Default for QuicConfiguration {
    fn default() -> Self {
        Self {
            mode: ListenMode::Datagram,
            io_queue_count: default_io_queue_count(),
            inline_completions: true,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            pause_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD,
            resume_writer_threshold: DEFAULT_RESUME_WRITER_THRESHOLD,
            datagram_channel_capacity: DEFAULT_DATAGRAM_CHANNEL_CAPACITY,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

/// Where the transport listens. Shared with the host: a wildcard port is
/// replaced by the port actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInformation {
    pub addr: SocketAddr,
    pub no_delay: bool,
}

impl EndpointInformation {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            no_delay: true,
        }
    }
}
