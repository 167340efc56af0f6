//! Chunk production seam for the source role.

use std::io;

use bytes::Bytes;

use meshcast_core::Chunk;

/// One unit pulled from the stream input.
#[derive(Debug, Clone)]
pub enum SourceItem {
    /// Raw bytes; the session assigns id and timestamp.
    Payload(Bytes),
    /// A chunk that already carries its identity.
    Chunk(Chunk),
}

pub trait ChunkSource: Send {
    /// Next item, or `None` at end of input.
    fn next_item(&mut self) -> io::Result<Option<SourceItem>>;
}
