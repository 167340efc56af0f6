//! Acceptance policy — which chunk ids a peer wants.
//!
//! `needs` answers "should this peer get chunk N" from a buffer map and the
//! peer's declared capacity. It is used both when answering an offer (about
//! ourselves) and before sending an accepted chunk (about the requester).

use std::time::{Duration, Instant};

use meshcast_core::{BufferMap, PeerId};

use crate::chunklock::ChunkLocks;

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptancePolicy {
    /// Chunks generated longer ago than this are never wanted.
    retention: Option<Duration>,
}

impl AcceptancePolicy {
    pub fn new(retention: Option<Duration>) -> Self {
        Self { retention }
    }

    /// Does a peer holding `target` with buffer `capacity` want `candidate`?
    ///
    /// `known_timestamp_us` is the candidate's generation time if this side
    /// holds it; without one the retention check is skipped.
    pub fn needs(
        &self,
        target: &BufferMap,
        capacity: u32,
        candidate: u32,
        known_timestamp_us: Option<u64>,
        now_us: u64,
    ) -> bool {
        if capacity == 0 {
            return false;
        }
        if let (Some(retention), Some(ts)) = (self.retention, known_timestamp_us) {
            let horizon = now_us.saturating_sub(retention.as_micros() as u64);
            if ts < horizon {
                return false;
            }
        }
        if target.contains(candidate) {
            return false;
        }
        let Some(earliest) = target.earliest() else {
            // Nothing known about the peer: assume it wants everything.
            return true;
        };
        let missing = (i64::from(capacity) - target.len() as i64).max(0);
        i64::from(candidate) >= i64::from(earliest) - missing
    }

    /// Pick what to accept from an offer, lowest id first.
    ///
    /// Skips ids locked by a concurrent accept and ids `own` does not need.
    /// Every accepted id is locked for `offerer`.
    #[allow(clippy::too_many_arguments)]
    pub fn decide_accept(
        &self,
        offered: &BufferMap,
        max_deliver: u32,
        own: &BufferMap,
        own_capacity: u32,
        locks: &mut ChunkLocks,
        offerer: PeerId,
        now: Instant,
        now_us: u64,
    ) -> BufferMap {
        let mut accepted = BufferMap::new();
        for id in offered.iter() {
            if accepted.len() >= max_deliver as usize {
                break;
            }
            if locks.is_locked(id, now) {
                tracing::trace!(chunk = id, "already requested elsewhere");
                continue;
            }
            if !self.needs(own, own_capacity, id, None, now_us) {
                continue;
            }
            locks.acquire(id, offerer, now);
            accepted.insert(id);
        }
        accepted
    }
}
