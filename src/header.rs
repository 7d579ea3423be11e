use crate::error::CodecError;
use crate::varint::{self, ensure_remaining};
use bytes::{Buf, BufMut};
use rand::Rng;
use std::fmt;

/// Longest connection id a long header can carry (nibble 15 + 3).
pub const MAX_CONNECTION_ID_LEN: usize = 18;

/// Opaque identifier of a connection, independent of the network path.
///
/// Unused trailing bytes are always zero, so the derived equality and hash
/// are defined on the id bytes alone.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CONNECTION_ID_LEN],
}

impl ConnectionId {
    pub fn new(id: &[u8]) -> Option<Self> {
        if id.len() > MAX_CONNECTION_ID_LEN {
            return None;
        }
        let mut bytes = [0; MAX_CONNECTION_ID_LEN];
        bytes[..id.len()].copy_from_slice(id);
        Some(Self {
            len: id.len() as u8,
            bytes,
        })
    }

    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CONNECTION_ID_LEN);
        let mut bytes = [0; MAX_CONNECTION_ID_LEN];
        rand::thread_rng().fill(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read<B: Buf>(buf: &mut B, len: usize) -> Result<Self, CodecError> {
        ensure_remaining(buf, len)?;
        let mut bytes = [0; MAX_CONNECTION_ID_LEN];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Converts a 4-bit length nibble to a connection id length: 0 stays 0,
/// anything else is offset by 3.
pub fn connection_id_len(nibble: u8) -> usize {
    match nibble & 0x0f {
        0 => 0,
        v => v as usize + 3,
    }
}

fn connection_id_nibble(id: &ConnectionId) -> Result<u8, CodecError> {
    match id.len() {
        0 => Ok(0),
        len @ 4..=MAX_CONNECTION_ID_LEN => Ok((len - 3) as u8),
        len => Err(CodecError::InvalidConnectionIdLength(len)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long(LongHeader),
}

impl Header {
    pub fn destination_connection_id(&self) -> &ConnectionId {
        match self {
            Self::Long(h) => &h.destination_connection_id,
        }
    }

    pub fn packet_number(&self) -> u32 {
        match self {
            Self::Long(h) => h.packet_number,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(h) => fmt::Display::fmt(h, f),
        }
    }
}

//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+
// |  Control (8)  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Version (32)                          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |DCIL(4)|SCIL(4)|
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |               Destination Connection ID (0/32..144)         ...
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Source Connection ID (0/32..144)            ...
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Payload Length (i)                    ...
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Packet Number (32)                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub version: [u8; 4],
    pub destination_connection_id: ConnectionId,
    pub source_connection_id: ConnectionId,
    /// Number of bytes following the packet number.
    pub payload_length: u64,
    pub packet_number: u32,
}

impl LongHeader {
    /// Parses a long header from a cursor positioned right after the control byte.
    pub fn parse<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        ensure_remaining(buf, 5)?;
        let mut version = [0; 4];
        buf.copy_to_slice(&mut version);

        let lengths = buf.get_u8();
        let dcil = connection_id_len(lengths >> 4);
        let scil = connection_id_len(lengths & 0x0f);

        let destination_connection_id = ConnectionId::read(buf, dcil)?;
        let source_connection_id = ConnectionId::read(buf, scil)?;
        let payload_length = varint::read(buf)?;

        ensure_remaining(buf, 4)?;
        let packet_number = buf.get_u32();

        Ok(Self {
            version,
            destination_connection_id,
            source_connection_id,
            payload_length,
            packet_number,
        })
    }

    /// Writes the header, without the control byte.
    pub fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        let lengths = (connection_id_nibble(&self.destination_connection_id)? << 4)
            | connection_id_nibble(&self.source_connection_id)?;
        varint::encoded_len(self.payload_length)?;

        buf.put_slice(&self.version);
        buf.put_u8(lengths);
        buf.put_slice(self.destination_connection_id.as_bytes());
        buf.put_slice(self.source_connection_id.as_bytes());
        varint::write(self.payload_length, buf)?;
        buf.put_u32(self.packet_number);
        Ok(())
    }
}

impl fmt::Display for LongHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} pn={} len={}",
            self.source_connection_id,
            self.destination_connection_id,
            self.packet_number,
            self.payload_length
        )
    }
}
