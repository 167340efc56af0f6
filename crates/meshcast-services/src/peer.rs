//! Neighbour state — what this peer believes about each neighbour.
//!
//! The protocol engine only reads and rewrites the buffer map, its refresh
//! time and the declared capacity of a `PeerView`. Which neighbours exist is
//! decided by a `Topology`; `PeerTable` is the table-backed one.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use meshcast_core::{BufferMap, PeerId};

use crate::lock;

/// Capacity assumed for a neighbour that has not advertised one.
pub const DEFAULT_PEER_CAPACITY: u32 = 50;

/// Selection weight of a neighbour whose buffer map was never refreshed.
const STALE_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct PeerView {
    pub id: PeerId,
    /// Last known holdings. Replaced wholesale on every report.
    pub bmap: BufferMap,
    pub bmap_timestamp: Option<Instant>,
    /// Declared chunk buffer capacity. 0 = wants no chunks.
    pub capacity: u32,
}

impl PeerView {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            bmap: BufferMap::new(),
            bmap_timestamp: None,
            capacity: DEFAULT_PEER_CAPACITY,
        }
    }

    /// Replace the known holdings with a fresh report.
    pub fn refresh(&mut self, bmap: BufferMap, now: Instant) {
        self.bmap.replace(bmap);
        self.bmap_timestamp = Some(now);
    }

    /// Preference when picking whom to offer to.
    pub fn weight(&self) -> f64 {
        if self.bmap_timestamp.is_some() {
            1.0
        } else {
            STALE_WEIGHT
        }
    }
}

pub type SharedPeer = Arc<Mutex<PeerView>>;

pub fn shared_peer(view: PeerView) -> SharedPeer {
    Arc::new(Mutex::new(view))
}

/// Source of the neighbour set.
pub trait Topology: Send + Sync {
    /// Snapshot of the current neighbours.
    fn neighbours(&self) -> Vec<SharedPeer>;

    /// Look up a peer by id, adding it as a neighbour when `register` is set.
    fn resolve_peer(&self, id: &PeerId, register: bool) -> Option<SharedPeer>;
}

// ── PeerTable ─────────────────────────────────────────────────────────────────

struct Neighbour {
    view: SharedPeer,
    last_seen: Instant,
    /// Configured neighbours never expire.
    pinned: bool,
}

/// Neighbour table with liveness tracking.
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<DashMap<PeerId, Neighbour>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Add a configured neighbour that never expires.
    pub fn add_pinned(&self, id: PeerId) -> SharedPeer {
        self.upsert(id, true, Instant::now())
    }

    /// Record that `id` was heard from, adding it if unknown.
    pub fn touch(&self, id: PeerId, now: Instant) -> SharedPeer {
        self.upsert(id, false, now)
    }

    fn upsert(&self, id: PeerId, pinned: bool, now: Instant) -> SharedPeer {
        let mut entry = self.peers.entry(id).or_insert_with(|| {
            tracing::info!(peer = %id, pinned, "neighbour added");
            Neighbour {
                view: shared_peer(PeerView::new(id)),
                last_seen: now,
                pinned,
            }
        });
        entry.last_seen = now;
        entry.pinned |= pinned;
        entry.view.clone()
    }

    /// Record a liveness hello carrying the neighbour's capacity.
    pub fn hello(&self, id: PeerId, capacity: u32, register: bool, now: Instant) -> bool {
        if !register && !self.contains(&id) {
            return false;
        }
        let view = self.touch(id, now);
        lock(&view).capacity = capacity;
        true
    }

    pub fn remove(&self, id: &PeerId) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Drop unpinned neighbours silent for longer than `ttl`. Returns the
    /// ids removed.
    pub fn expire(&self, ttl: Duration, now: Instant) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.peers.retain(|id, n| {
            let keep = n.pinned || now.saturating_duration_since(n.last_seen) < ttl;
            if !keep {
                removed.push(*id);
            }
            keep
        });
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "expired neighbours");
        }
        removed
    }
}

impl Topology for PeerTable {
    fn neighbours(&self) -> Vec<SharedPeer> {
        let mut peers: Vec<(PeerId, SharedPeer)> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.value().view.clone()))
            .collect();
        peers.sort_by_key(|(id, _)| *id);
        peers.into_iter().map(|(_, v)| v).collect()
    }

    fn resolve_peer(&self, id: &PeerId, register: bool) -> Option<SharedPeer> {
        if let Some(n) = self.peers.get(id) {
            return Some(n.view.clone());
        }
        register.then(|| self.touch(*id, Instant::now()))
    }
}
