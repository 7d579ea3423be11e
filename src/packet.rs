use crate::error::CodecError;
use crate::header::{ConnectionId, Header, LongHeader};
use bytes::Buf;
use std::fmt;

/// Bit of the control byte selecting the long header form.
pub const LONG_HEADER_FLAG: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Initial = 0x7f,
    Retry = 0x7e,
    Handshake = 0x7d,
    ZeroRttProtected = 0x7c,
}

impl PacketType {
    /// Type codes in the order they are matched against the control byte.
    pub const DISPATCH_ORDER: [PacketType; 4] = [
        Self::Initial,
        Self::Retry,
        Self::Handshake,
        Self::ZeroRttProtected,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Type codes overlap (0x7c is contained in all of the others), so a code
    /// matches when all of its bits are set and the first match wins.
    /// Matching on any shared bit instead would send every byte that shares a
    /// bit with 0x7f to `Initial` and leave the other types unreachable.
    pub fn from_control_byte(control: u8) -> Option<Self> {
        Self::DISPATCH_ORDER
            .into_iter()
            .find(|ty| control & ty.code() == ty.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPacket {
    header: Option<Header>,
    header_len: usize,
}

impl InitialPacket {
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Offset of the payload in the datagram, control byte included.
    pub fn header_len(&self) -> usize {
        self.header_len
    }
}

impl fmt::Display for InitialPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(header) = &self.header {
            write!(f, "{} ", header)?;
        }
        write!(f, "Initial({:#04x})", PacketType::Initial.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Initial(InitialPacket),
}

impl Packet {
    /// Parses the packet framing of a datagram. The input is left untouched.
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let mut buf = raw;
        if buf.is_empty() {
            return Err(CodecError::UnexpectedEnd {
                needed: 1,
                remaining: 0,
            });
        }
        let control = buf.get_u8();

        let header = match control & LONG_HEADER_FLAG != 0 {
            true => Some(Header::Long(LongHeader::parse(&mut buf)?)),
            false => None,
        };
        let header_len = raw.len() - buf.remaining();

        match PacketType::from_control_byte(control) {
            Some(PacketType::Initial) => Ok(Self::Initial(InitialPacket { header, header_len })),
            Some(ty) => Err(CodecError::UnimplementedPacketType(ty)),
            None => Err(CodecError::UnrecognizedPacketType(control)),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Initial(_) => PacketType::Initial,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        match self {
            Self::Initial(p) => p.header(),
        }
    }

    pub fn destination_connection_id(&self) -> Option<&ConnectionId> {
        self.header().map(Header::destination_connection_id)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial(p) => fmt::Display::fmt(p, f),
        }
    }
}
