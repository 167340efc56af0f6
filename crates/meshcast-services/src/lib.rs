//! meshcast-services — the chunk exchange engine and the seams it talks
//! through (transport, topology, output, telemetry).

use std::sync::{Mutex, MutexGuard};

pub mod acceptance;
pub mod chunk_buffer;
pub mod chunklock;
pub mod peer;
pub mod playout;
pub mod ratecontrol;
pub mod scheduler;
pub mod source;
pub mod streaming;
pub mod telemetry;
pub mod transaction;
pub mod transport;

pub use acceptance::AcceptancePolicy;
pub use chunk_buffer::{AddOutcome, ChunkBuffer};
pub use chunklock::ChunkLocks;
pub use peer::{shared_peer, PeerTable, PeerView, SharedPeer, Topology};
pub use playout::{ChunkSink, MemorySink, PlayoutBuffer, PlayoutOutcome};
pub use ratecontrol::{RateControlParams, RateController};
pub use source::{ChunkSource, SourceItem};
pub use streaming::{Role, SessionConfig, StreamError, StreamingSession};
pub use telemetry::{Measures, MeasuresSnapshot, NoTelemetry, Telemetry};
pub use transaction::{AckOutcome, TransactionRegistry};
pub use transport::{Transport, TransportError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
