//! Transport seam — how encoded messages leave this peer.
//!
//! Sends are synchronous and non-blocking: a datagram either goes out now
//! or the send fails. Reception is driven by the caller, which hands each
//! datagram to the streaming session.

use std::io;

use meshcast_core::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send to {peer} failed: {source}")]
    Io {
        peer: PeerId,
        #[source]
        source: io::Error,
    },
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("message of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

pub trait Transport: Send + Sync {
    /// Send one message. Returns the number of bytes sent.
    fn send_to(&self, peer: &PeerId, bytes: &[u8]) -> Result<usize, TransportError>;
}
