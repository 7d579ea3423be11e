//! QUIC-style packet codec and connection transport built on Tokio.
//!
//! The codec side parses long-header packets out of raw datagrams. The
//! transport side listens on a UDP (or TCP) socket, routes inbound traffic by
//! destination connection id and drives one duplex pipeline per connection.

mod buffer_pool;
mod configuration;
mod connection;
mod error;
mod header;
mod io_queue;
mod packet;
mod pipe;
mod routing;
mod signal;
mod socket;
mod sync;
mod transport;
pub mod varint;

pub use buffer_pool::BufferPool;
pub use configuration::{
    default_io_queue_count, EndpointInformation, ListenMode, QuicConfiguration,
    MAX_IO_QUEUE_COUNT, PREFERRED_SEGMENT_SIZE,
};
pub use connection::{ConnectionContext, ConnectionDispatcher, ConnectionState, QuicConnection};
pub use error::{CodecError, ConnectionError, DispatchError, TransportError};
pub use header::{connection_id_len, ConnectionId, Header, LongHeader, MAX_CONNECTION_ID_LEN};
pub use io_queue::{IoQueue, IoQueuePool};
pub use packet::{InitialPacket, Packet, PacketType, LONG_HEADER_FLAG};
pub use pipe::{pipe, FlushResult, Pipe, PipeMetrics, PipeOptions, PipeReader, PipeWriter, ReadResult};
pub use routing::ConnectionTable;
pub use signal::Signal;
pub use socket::{ConnectionSocket, DatagramSocket, StreamSocket};
pub use transport::{ApplicationLifetime, QuicTransport};
