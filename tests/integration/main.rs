//! meshcast integration test harness.
//!
//! Runs several streaming sessions in one process, wired together by an
//! in-memory transport. Nothing is delivered until the test pumps the
//! queue, so every run is a sequence of explicit rounds:
//!
//!   produce → offer → pump until quiet → repeat
//!
//! Peers can join, leave or go silent between rounds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use bytes::Bytes;

use meshcast_core::wire::{self, MessageKind};
use meshcast_core::PeerId;
use meshcast_services::{
    ChunkSource, Measures, MemorySink, PeerTable, Role, SessionConfig, SourceItem, StreamingSession,
    Transport, TransportError,
};

mod churn;
mod control;
mod streaming;

// ── Transport ─────────────────────────────────────────────────────────────────

type Wire = Arc<Mutex<VecDeque<(PeerId, PeerId, Vec<u8>)>>>;

/// Queues every send on the shared wire, tagged with its sender.
pub struct QueueTransport {
    me: PeerId,
    wire: Wire,
}

impl Transport for QueueTransport {
    fn send_to(&self, peer: &PeerId, bytes: &[u8]) -> Result<usize, TransportError> {
        self.wire
            .lock()
            .unwrap()
            .push_back((self.me, *peer, bytes.to_vec()));
        Ok(bytes.len())
    }
}

/// Fixed payloads, numbered by the session.
pub struct Counter;

impl ChunkSource for Counter {
    fn next_item(&mut self) -> io::Result<Option<SourceItem>> {
        Ok(Some(SourceItem::Payload(Bytes::from_static(b"payload"))))
    }
}

// ── Mesh ──────────────────────────────────────────────────────────────────────

pub struct Node {
    pub id: PeerId,
    pub session: Arc<StreamingSession>,
    pub table: PeerTable,
    pub sink: MemorySink,
    pub measures: Measures,
}

#[derive(Default)]
pub struct Mesh {
    wire: Wire,
    pub nodes: Vec<Node>,
    /// Peers whose inbound traffic is discarded.
    silent: HashSet<PeerId>,
    pub delivered: usize,
}

pub fn peer(n: u16) -> PeerId {
    format!("10.0.0.{}:6666", n).parse().unwrap()
}

/// Defaults tuned for lock-step rounds.
pub fn test_config(role: Role) -> SessionConfig {
    SessionConfig {
        role,
        offer_horizon: std::time::Duration::ZERO,
        offers_per_tick: 8,
        chunks_per_offer: 2,
        source_multiplicity: 1,
        ..SessionConfig::default()
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer linked to every peer already in the mesh.
    pub fn join(&mut self, id: PeerId, config: SessionConfig) -> &Node {
        let all: Vec<PeerId> = self.nodes.iter().map(|n| n.id).collect();
        self.join_linked(id, config, &all)
    }

    /// Add a peer linked to `links` only.
    pub fn join_linked(&mut self, id: PeerId, config: SessionConfig, links: &[PeerId]) -> &Node {
        let table = PeerTable::new();
        let sink = MemorySink::new();
        let measures = Measures::new();
        let transport = Arc::new(QueueTransport {
            me: id,
            wire: self.wire.clone(),
        });
        let session = Arc::new(StreamingSession::new(
            config,
            Arc::new(table.clone()),
            transport,
            Arc::new(measures.clone()),
            Box::new(sink.clone()),
        ));
        for other in self.nodes.iter().filter(|n| links.contains(&n.id)) {
            other.table.add_pinned(id);
            table.add_pinned(other.id);
        }
        self.nodes.push(Node {
            id,
            session,
            table,
            sink,
            measures,
        });
        self.nodes.last().unwrap()
    }

    /// Remove a peer; messages still queued for it are lost.
    pub fn leave(&mut self, id: PeerId) {
        self.nodes.retain(|n| n.id != id);
        for n in &self.nodes {
            n.table.remove(&id);
        }
    }

    pub fn silence(&mut self, id: PeerId) {
        self.silent.insert(id);
    }

    pub fn node(&self, id: PeerId) -> &Node {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// Deliver queued messages, including the replies they trigger, until
    /// the wire is empty. Fails if traffic never settles.
    pub fn pump(&mut self) -> Result<usize> {
        let by_id: HashMap<PeerId, Arc<StreamingSession>> =
            self.nodes.iter().map(|n| (n.id, n.session.clone())).collect();
        let mut handled = 0;
        loop {
            let next = self.wire.lock().unwrap().pop_front();
            let Some((from, to, bytes)) = next else {
                break;
            };
            handled += 1;
            if handled > 100_000 {
                bail!("traffic did not settle");
            }
            if self.silent.contains(&to) {
                continue;
            }
            let Some(session) = by_id.get(&to) else {
                continue;
            };
            match wire::message_kind(&bytes)? {
                MessageKind::Signaling => session.handle_signaling(&from, &bytes)?,
                MessageKind::Chunk => session.receive_chunk(&from, &bytes)?,
                MessageKind::Topology => {}
            }
        }
        self.delivered += handled;
        Ok(handled)
    }

    /// One round: every peer advertises and offers, then traffic settles.
    pub fn round(&mut self) -> Result<()> {
        for n in &self.nodes {
            n.session.broadcast_bmap();
            n.session.send_offer()?;
        }
        self.pump()?;
        Ok(())
    }

    /// Have `source` produce and push one chunk, then run a round.
    pub fn produce(&mut self, source: PeerId) -> Result<u32> {
        let session = self.node(source).session.clone();
        let chunk = session.generate_chunk(&mut Counter)?;
        let Some(chunk) = chunk else {
            bail!("counter never ends");
        };
        session.inject_chunk(chunk.id)?;
        self.round()?;
        Ok(chunk.id)
    }
}

/// Played ids rise strictly: no duplicates, no going back.
pub fn assert_strictly_increasing(ids: &[u32]) {
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "playout went from {} to {}", pair[0], pair[1]);
    }
}
