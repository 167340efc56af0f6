//! Chunk id locks — leased claims taken when an offer is accepted.
//!
//! Accepting chunk N from one offerer locks N so a concurrent offer from
//! another peer does not get N accepted twice. The lock is released when
//! N arrives, or silently expires after the lease.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshcast_core::PeerId;

#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: PeerId,
    acquired: Instant,
}

#[derive(Debug)]
pub struct ChunkLocks {
    lease: Duration,
    held: HashMap<u32, Lease>,
}

impl ChunkLocks {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            held: HashMap::new(),
        }
    }

    /// Claim `id` for `owner`, replacing any previous lease on it.
    pub fn acquire(&mut self, id: u32, owner: PeerId, now: Instant) {
        self.held.insert(id, Lease { owner, acquired: now });
    }

    pub fn release(&mut self, id: u32) {
        self.held.remove(&id);
    }

    /// Reclaims expired leases, then looks `id` up.
    pub fn is_locked(&mut self, id: u32, now: Instant) -> bool {
        self.reclaim(now);
        self.held.contains_key(&id)
    }

    pub fn owner(&self, id: u32) -> Option<PeerId> {
        self.held.get(&id).map(|l| l.owner)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn reclaim(&mut self, now: Instant) {
        let lease = self.lease;
        self.held
            .retain(|_, l| now.saturating_duration_since(l.acquired) < lease);
    }
}
