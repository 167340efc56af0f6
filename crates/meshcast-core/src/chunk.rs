//! Chunks — the unit of stream data exchanged between peers.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Default forwarding priority. The deadline advances by twice this on
/// every send.
pub const DEFAULT_PRIORITY: u16 = 1;

/// Forwarding attributes carried with every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAttributes {
    /// Virtual send time. Starts at the chunk id.
    pub deadline: u64,
    pub deadline_increment: u16,
    /// Hops travelled so far. Only the receiving side increments it.
    pub hopcount: u16,
}

impl ChunkAttributes {
    pub fn fresh(id: u32, priority: u16) -> Self {
        Self {
            deadline: u64::from(id),
            deadline_increment: priority.saturating_mul(2),
            hopcount: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    /// Generation time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub payload: Bytes,
    pub attributes: ChunkAttributes,
}

impl Chunk {
    /// A freshly produced chunk with default attributes.
    pub fn new(id: u32, timestamp_us: u64, payload: Bytes) -> Self {
        Self {
            id,
            timestamp_us,
            payload,
            attributes: ChunkAttributes::fresh(id, DEFAULT_PRIORITY),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Rewrite attributes before handing the chunk to transport.
    pub fn advance_for_send(&mut self) {
        self.attributes.deadline = self
            .attributes
            .deadline
            .saturating_add(u64::from(self.attributes.deadline_increment));
    }

    /// Rewrite attributes after the chunk arrived from the network.
    pub fn mark_received(&mut self) {
        self.attributes.hopcount = self.attributes.hopcount.saturating_add(1);
    }
}

/// Wall-clock microseconds. Chunk timestamps travel between hosts, so they
/// cannot come from a process-local monotonic clock.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
