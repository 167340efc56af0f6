//! meshcast wire format — on-wire types for every datagram a peer sends.
//!
//! The first byte of every message is a kind discriminator:
//!   0x01  topology hello
//!   0x11  chunk
//!   0x12  signaling (buffer map, offer, accept, ack)
//!
//! Fixed-size headers are `#[repr(C, packed)]` with explicit little-endian
//! integer fields and zerocopy derives, so layout is identical on every
//! host. Variable-length tails (chunk id lists, payloads) follow the header.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::buffermap::BufferMap;
use crate::chunk::{Chunk, ChunkAttributes};

pub const KIND_TOPOLOGY: u8 = 0x01;
pub const KIND_CHUNK: u8 = 0x11;
pub const KIND_SIGNALING: u8 = 0x12;

/// Version carried in topology hellos. Unknown versions are dropped.
pub const HELLO_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Topology,
    Chunk,
    Signaling,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            KIND_TOPOLOGY => Ok(Self::Topology),
            KIND_CHUNK => Ok(Self::Chunk),
            KIND_SIGNALING => Ok(Self::Signaling),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Read the discriminator of a received datagram.
pub fn message_kind(bytes: &[u8]) -> Result<MessageKind, WireError> {
    match bytes.first() {
        Some(&b) => MessageKind::try_from(b),
        None => Err(WireError::Empty),
    }
}

// ── Signaling ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalKind {
    BufferMap = 1,
    Offer = 2,
    Accept = 3,
    Ack = 4,
}

impl TryFrom<u8> for SignalKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::BufferMap),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Accept),
            4 => Ok(Self::Ack),
            other => Err(WireError::UnknownSignal(other)),
        }
    }
}

/// Header of every signaling message, followed by `id_count` u32 LE ids.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SignalHeader {
    /// Always KIND_SIGNALING.
    pub kind: u8,
    /// SignalKind discriminator.
    pub signal: u8,
    /// Transaction id chosen by the offering side. 0 for buffer maps.
    pub trans_id: U16<LittleEndian>,
    /// Upper bound on chunks the offerer will deliver. Offers only.
    pub max_deliver: U32<LittleEndian>,
    /// Declared chunk buffer capacity of the sender. 0 = accepts nothing.
    pub capacity: U32<LittleEndian>,
    pub id_count: U32<LittleEndian>,
}

assert_eq_size!(SignalHeader, [u8; 16]);

/// A decoded signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    BufferMap { capacity: u32, ids: BufferMap },
    Offer { trans_id: u16, max_deliver: u32, ids: BufferMap },
    Accept { trans_id: u16, ids: BufferMap },
    /// Acknowledges a delivered chunk and carries the receiver's holdings.
    Ack { trans_id: u16, ids: BufferMap },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::BufferMap { .. } => SignalKind::BufferMap,
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Accept { .. } => SignalKind::Accept,
            Signal::Ack { .. } => SignalKind::Ack,
        }
    }

    pub fn ids(&self) -> &BufferMap {
        match self {
            Signal::BufferMap { ids, .. }
            | Signal::Offer { ids, .. }
            | Signal::Accept { ids, .. }
            | Signal::Ack { ids, .. } => ids,
        }
    }
}

pub fn encode_signal(signal: &Signal) -> Vec<u8> {
    let (trans_id, max_deliver, capacity) = match signal {
        Signal::BufferMap { capacity, .. } => (0, 0, *capacity),
        Signal::Offer {
            trans_id,
            max_deliver,
            ..
        } => (*trans_id, *max_deliver, 0),
        Signal::Accept { trans_id, .. } | Signal::Ack { trans_id, .. } => (*trans_id, 0, 0),
    };
    let ids = signal.ids();
    let header = SignalHeader {
        kind: KIND_SIGNALING,
        signal: signal.kind() as u8,
        trans_id: U16::new(trans_id),
        max_deliver: U32::new(max_deliver),
        capacity: U32::new(capacity),
        id_count: U32::new(ids.len() as u32),
    };

    let mut out = Vec::with_capacity(std::mem::size_of::<SignalHeader>() + ids.len() * 4);
    out.extend_from_slice(header.as_bytes());
    for id in ids.iter() {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn decode_signal(bytes: &[u8]) -> Result<Signal, WireError> {
    let header_len = std::mem::size_of::<SignalHeader>();
    let header = SignalHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        what: "signal header",
        need: header_len,
        have: bytes.len(),
    })?;
    expect_kind(header.kind, KIND_SIGNALING)?;
    let kind = SignalKind::try_from(header.signal)?;

    let count = header.id_count.get() as usize;
    let tail = &bytes[header_len..];
    let need = count.checked_mul(4).ok_or(WireError::Truncated {
        what: "signal id list",
        need: usize::MAX,
        have: tail.len(),
    })?;
    if tail.len() < need {
        return Err(WireError::Truncated {
            what: "signal id list",
            need,
            have: tail.len(),
        });
    }
    let ids: BufferMap = tail[..need]
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let trans_id = header.trans_id.get();
    Ok(match kind {
        SignalKind::BufferMap => Signal::BufferMap {
            capacity: header.capacity.get(),
            ids,
        },
        SignalKind::Offer => Signal::Offer {
            trans_id,
            max_deliver: header.max_deliver.get(),
            ids,
        },
        SignalKind::Accept => Signal::Accept { trans_id, ids },
        SignalKind::Ack => Signal::Ack { trans_id, ids },
    })
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// Header preceding every chunk payload.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkWireHeader {
    /// Always KIND_CHUNK.
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// Transaction the receiver must echo in its ack.
    pub trans_id: U16<LittleEndian>,
    pub id: U32<LittleEndian>,
    /// Generation time, microseconds since the Unix epoch.
    pub timestamp: U64<LittleEndian>,
    pub deadline: U64<LittleEndian>,
    pub deadline_increment: U16<LittleEndian>,
    pub hopcount: U16<LittleEndian>,
    pub payload_len: U32<LittleEndian>,
}

assert_eq_size!(ChunkWireHeader, [u8; 32]);

pub fn encode_chunk(chunk: &Chunk, trans_id: u16) -> Result<Vec<u8>, WireError> {
    let payload_len =
        u32::try_from(chunk.payload.len()).map_err(|_| WireError::PayloadTooLarge(chunk.payload.len()))?;
    let header = ChunkWireHeader {
        kind: KIND_CHUNK,
        flags: 0,
        trans_id: U16::new(trans_id),
        id: U32::new(chunk.id),
        timestamp: U64::new(chunk.timestamp_us),
        deadline: U64::new(chunk.attributes.deadline),
        deadline_increment: U16::new(chunk.attributes.deadline_increment),
        hopcount: U16::new(chunk.attributes.hopcount),
        payload_len: U32::new(payload_len),
    };
    let mut out = Vec::with_capacity(std::mem::size_of::<ChunkWireHeader>() + chunk.payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&chunk.payload);
    Ok(out)
}

/// Decode a chunk message. Returns the chunk and the transaction id to ack.
pub fn decode_chunk(bytes: &[u8]) -> Result<(Chunk, u16), WireError> {
    let header_len = std::mem::size_of::<ChunkWireHeader>();
    let header = ChunkWireHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        what: "chunk header",
        need: header_len,
        have: bytes.len(),
    })?;
    expect_kind(header.kind, KIND_CHUNK)?;

    let payload_len = header.payload_len.get() as usize;
    let tail = &bytes[header_len..];
    if tail.len() < payload_len {
        return Err(WireError::Truncated {
            what: "chunk payload",
            need: payload_len,
            have: tail.len(),
        });
    }

    let chunk = Chunk {
        id: header.id.get(),
        timestamp_us: header.timestamp.get(),
        payload: Bytes::copy_from_slice(&tail[..payload_len]),
        attributes: ChunkAttributes {
            deadline: header.deadline.get(),
            deadline_increment: header.deadline_increment.get(),
            hopcount: header.hopcount.get(),
        },
    };
    Ok((chunk, header.trans_id.get()))
}

// ── Topology hello ────────────────────────────────────────────────────────────

/// Periodic neighbour liveness announcement.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloHeader {
    /// Always KIND_TOPOLOGY.
    pub kind: u8,
    pub version: u8,
    /// 1 if the sender is the stream source.
    pub source: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// Declared chunk buffer capacity of the sender.
    pub capacity: U32<LittleEndian>,
}

assert_eq_size!(HelloHeader, [u8; 8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub source: bool,
    pub capacity: u32,
}

pub fn encode_hello(hello: &Hello) -> Vec<u8> {
    HelloHeader {
        kind: KIND_TOPOLOGY,
        version: HELLO_VERSION,
        source: u8::from(hello.source),
        flags: 0,
        capacity: U32::new(hello.capacity),
    }
    .as_bytes()
    .to_vec()
}

pub fn decode_hello(bytes: &[u8]) -> Result<Hello, WireError> {
    let header = HelloHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        what: "hello",
        need: std::mem::size_of::<HelloHeader>(),
        have: bytes.len(),
    })?;
    expect_kind(header.kind, KIND_TOPOLOGY)?;
    if header.version != HELLO_VERSION {
        return Err(WireError::UnsupportedVersion(header.version));
    }
    Ok(Hello {
        source: header.source != 0,
        capacity: header.capacity.get(),
    })
}

fn expect_kind(found: u8, expected: u8) -> Result<(), WireError> {
    if found == expected {
        Ok(())
    } else {
        Err(WireError::WrongKind { expected, found })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("expected message kind {expected:#04x}, found {found:#04x}")]
    WrongKind { expected: u8, found: u8 },
    #[error("unknown signaling type {0}")]
    UnknownSignal(u8),
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("payload of {0} bytes does not fit a chunk")]
    PayloadTooLarge(usize),
    #[error("unsupported hello version {0}")]
    UnsupportedVersion(u8),
}
