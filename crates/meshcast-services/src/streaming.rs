//! Streaming session — the chunk exchange engine of one peer.
//!
//! Owns everything the protocol mutates (chunk buffer, id locks, playout
//! window, transaction registry, rate controller) and drives the four
//! signaling messages:
//!
//!   buffer map  → replace the sender's known holdings
//!   offer       → pick what we need, lock it, answer with an accept
//!   accept      → deliver the accepted chunks, one transaction each
//!   ack         → close the delivery transaction, feed rate control
//!
//! Each offer/accept/deliver/ack run is independent and bounded by the
//! transaction lifetime; nothing requires answers to arrive in order.
//!
//! Lock order, outermost first: topology (inside `Topology`), exchange
//! state, a single `PeerView`, control state. No lock is held across an
//! `.await`; nothing in here is async.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshcast_core::config::MeshcastConfig;
use meshcast_core::wire::{self, Signal, WireError};
use meshcast_core::{now_micros, BufferMap, Chunk, PeerId};

use crate::acceptance::AcceptancePolicy;
use crate::chunk_buffer::{AddOutcome, ChunkBuffer};
use crate::chunklock::ChunkLocks;
use crate::lock;
use crate::peer::{SharedPeer, Topology};
use crate::playout::{ChunkSink, PlayoutBuffer};
use crate::ratecontrol::{RateControlParams, RateController};
use crate::scheduler::select_weighted;
use crate::source::{ChunkSource, SourceItem};
use crate::telemetry::Telemetry;
use crate::transaction::{AckOutcome, TransactionRegistry};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces the stream. Declares capacity 0 and never requests chunks.
    Source,
    Relay,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub buffer_size: u32,
    pub playout_window: usize,
    pub reorder: bool,
    pub output_range: (Option<u32>, Option<u32>),
    pub chunks_per_offer: u32,
    pub offers_per_tick: u32,
    pub source_multiplicity: u32,
    pub retention: Option<Duration>,
    pub offer_horizon: Duration,
    pub chunk_loss_interval: u32,
    pub lock_lease: Duration,
    pub transaction_lifetime: Duration,
    pub initial_period: Duration,
    pub rate: RateControlParams,
}

impl SessionConfig {
    pub fn from_config(c: &MeshcastConfig) -> Self {
        Self {
            role: if c.is_source() { Role::Source } else { Role::Relay },
            buffer_size: c.stream.buffer_size,
            playout_window: c.stream.playout_window as usize,
            reorder: c.stream.reorder,
            output_range: c.stream.output_range(),
            chunks_per_offer: c.stream.chunks_per_offer,
            offers_per_tick: c.stream.offers_per_tick,
            source_multiplicity: c.stream.source_multiplicity,
            retention: c.stream.retention(),
            offer_horizon: c.stream.offer_horizon(),
            chunk_loss_interval: c.stream.chunk_loss_interval,
            lock_lease: c.protocol.lock_lease(),
            transaction_lifetime: c.protocol.transaction_lifetime(),
            initial_period: c.stream.initial_period(),
            rate: RateControlParams::from(&c.rate_control),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&MeshcastConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("chunk source failed: {0}")]
    Source(#[from] io::Error),
}

/// Chunk-side state: one critical section.
struct Exchange {
    buffer: ChunkBuffer,
    locks: ChunkLocks,
    playout: PlayoutBuffer,
    next_id: u32,
}

/// Timing-side state: one critical section.
struct Control {
    registry: TransactionRegistry,
    rate: RateController,
}

pub struct StreamingSession {
    config: SessionConfig,
    policy: AcceptancePolicy,
    topology: Arc<dyn Topology>,
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn Telemetry>,
    exchange: Mutex<Exchange>,
    control: Mutex<Control>,
}

impl StreamingSession {
    pub fn new(
        config: SessionConfig,
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn Telemetry>,
        sink: Box<dyn ChunkSink>,
    ) -> Self {
        let exchange = Exchange {
            buffer: ChunkBuffer::new(config.buffer_size as usize),
            locks: ChunkLocks::new(config.lock_lease),
            playout: PlayoutBuffer::new(config.playout_window, config.reorder, config.output_range, sink),
            next_id: 0,
        };
        let control = Control {
            registry: TransactionRegistry::new(config.transaction_lifetime, telemetry.clone()),
            rate: RateController::new(config.rate.clone(), config.initial_period, telemetry.clone()),
        };
        Self {
            policy: AcceptancePolicy::new(config.retention),
            config,
            topology,
            transport,
            telemetry,
            exchange: Mutex::new(exchange),
            control: Mutex::new(control),
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current offer period chosen by rate control.
    pub fn period(&self) -> Duration {
        lock(&self.control).rate.period()
    }

    /// Capacity advertised to neighbours.
    pub fn declared_capacity(&self) -> u32 {
        match self.config.role {
            Role::Source => 0,
            Role::Relay => self.config.buffer_size,
        }
    }

    pub fn buffer_map(&self) -> BufferMap {
        lock(&self.exchange).buffer.buffer_map()
    }

    pub fn chunk(&self, id: u32) -> Option<Chunk> {
        lock(&self.exchange).buffer.get(id).cloned()
    }

    pub fn next_playout(&self) -> Option<u64> {
        lock(&self.exchange).playout.next_expected()
    }

    pub fn pending_transactions(&self) -> usize {
        lock(&self.control).registry.len()
    }

    /// Expire transactions that outlived their lifetime. Each one counts as
    /// a failed reception for its peer.
    pub fn sweep_transactions(&self) -> usize {
        lock(&self.control).registry.sweep_expired(Instant::now())
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Decode and act on one signaling datagram.
    pub fn handle_signaling(&self, from: &PeerId, bytes: &[u8]) -> Result<(), StreamError> {
        let signal = wire::decode_signal(bytes)?;
        self.on_signal(from, signal)
    }

    pub fn on_signal(&self, from: &PeerId, signal: Signal) -> Result<(), StreamError> {
        match signal {
            Signal::BufferMap { capacity, ids } => {
                self.bmap_received(from, capacity, ids);
                Ok(())
            }
            Signal::Offer {
                trans_id,
                max_deliver,
                ids,
            } => self.offer_received(from, trans_id, max_deliver, ids),
            Signal::Accept { trans_id, ids } => self.accept_received(from, trans_id, ids),
            Signal::Ack { trans_id, ids } => {
                self.ack_received(from, trans_id, ids);
                Ok(())
            }
        }
    }

    fn bmap_received(&self, from: &PeerId, capacity: u32, ids: BufferMap) {
        let Some(peer) = self.topology.resolve_peer(from, false) else {
            tracing::trace!(peer = %from, "buffer map from unknown peer ignored");
            return;
        };
        let mut view = lock(&peer);
        view.refresh(ids, Instant::now());
        view.capacity = capacity;
    }

    fn offer_received(
        &self,
        from: &PeerId,
        trans_id: u16,
        max_deliver: u32,
        ids: BufferMap,
    ) -> Result<(), StreamError> {
        let now = Instant::now();
        if let Some(peer) = self.topology.resolve_peer(from, false) {
            // An offer lists what the sender holds.
            lock(&peer).refresh(ids.clone(), now);
        }

        let accepted = {
            let mut ex = lock(&self.exchange);
            let own = ex.buffer.buffer_map();
            self.policy.decide_accept(
                &ids,
                max_deliver,
                &own,
                self.declared_capacity(),
                &mut ex.locks,
                *from,
                now,
                now_micros(),
            )
        };
        tracing::debug!(
            peer = %from,
            trans_id,
            offered = ids.len(),
            accepted = accepted.len(),
            "offer answered"
        );
        self.telemetry.offer_accept_in(from, !accepted.is_empty());
        self.send_signal(from, &Signal::Accept { trans_id, ids: accepted })?;
        Ok(())
    }

    fn accept_received(&self, from: &PeerId, trans_id: u16, ids: BufferMap) -> Result<(), StreamError> {
        let now = Instant::now();
        let peer = self.topology.resolve_peer(from, false);
        if let Some(peer) = &peer {
            lock(peer).bmap_timestamp = Some(now);
        }

        {
            let mut ctl = lock(&self.control);
            ctl.rate.on_accept(!ids.is_empty());
            if ctl.registry.register_accept(trans_id, from, now) {
                // Each delivered chunk gets its own transaction from here on.
                ctl.registry.retire(trans_id);
            } else {
                tracing::debug!(peer = %from, trans_id, "accept for unknown offer");
            }
        }
        self.telemetry.offer_accept_out(from, !ids.is_empty());

        let max_deliver = ids.len();
        self.send_accepted(from, peer.as_ref(), &ids, max_deliver, now);
        Ok(())
    }

    /// Deliver accepted chunks that are still held and still wanted.
    fn send_accepted(
        &self,
        to: &PeerId,
        peer: Option<&SharedPeer>,
        ids: &BufferMap,
        max_deliver: usize,
        accepted_at: Instant,
    ) -> usize {
        let now_us = now_micros();
        let mut delivered = 0;
        let mut ex = lock(&self.exchange);

        for id in ids.iter() {
            if delivered >= max_deliver {
                break;
            }
            let Some(stored) = ex.buffer.get_mut(id) else {
                tracing::debug!(peer = %to, chunk = id, "accepted chunk no longer held");
                continue;
            };
            if let Some(peer) = peer {
                let view = lock(peer);
                if !self.policy.needs(&view.bmap, view.capacity, id, Some(stored.timestamp_us), now_us) {
                    continue;
                }
            }
            stored.advance_for_send();
            let chunk = stored.clone();

            let trans_id = lock(&self.control)
                .registry
                .create_delivery(*to, accepted_at, Instant::now());
            match self.send_chunk_to(to, &chunk, trans_id) {
                Ok(_) => {
                    if let Some(peer) = peer {
                        lock(peer).bmap.insert(id);
                    }
                    self.telemetry.chunk_sent(to, id);
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %to, chunk = id, error = %e, "chunk send failed");
                    lock(&self.control).registry.retire(trans_id);
                }
            }
        }
        delivered
    }

    fn ack_received(&self, from: &PeerId, trans_id: u16, ids: BufferMap) {
        let now = Instant::now();
        if let Some(peer) = self.topology.resolve_peer(from, false) {
            lock(&peer).refresh(ids, now);
        }

        let mut ctl = lock(&self.control);
        match ctl.registry.consume_on_ack(trans_id, now) {
            AckOutcome::QueueDelay(delay) => ctl.rate.on_ack(delay, now),
            AckOutcome::Unaccepted => {
                tracing::trace!(peer = %from, trans_id, "ack for pushed chunk");
            }
            AckOutcome::NotFound => {
                tracing::debug!(peer = %from, trans_id, "ack for unknown transaction dropped");
            }
        }
    }

    /// Decode a chunk datagram and take the chunk in.
    pub fn receive_chunk(&self, from: &PeerId, bytes: &[u8]) -> Result<(), StreamError> {
        let (chunk, trans_id) = wire::decode_chunk(bytes)?;
        self.deliver_chunk(from, chunk, trans_id)
    }

    /// Take in a chunk that arrived from `from`, then ack it.
    pub fn deliver_chunk(&self, from: &PeerId, mut chunk: Chunk, trans_id: u16) -> Result<(), StreamError> {
        let interval = self.config.chunk_loss_interval;
        if interval > 0 && chunk.id % interval == 0 {
            tracing::debug!(chunk = chunk.id, "injected loss, chunk discarded");
            return Ok(());
        }
        chunk.mark_received();

        let (outcome, own) = {
            let mut ex = lock(&self.exchange);
            ex.locks.release(chunk.id);
            ex.playout.push(chunk.clone(), self.telemetry.as_ref());
            let outcome = ex.buffer.add(chunk.clone());
            (outcome, ex.buffer.buffer_map())
        };
        self.telemetry.chunk_received(
            chunk.id,
            chunk.timestamp_us,
            chunk.attributes.hopcount,
            outcome,
        );
        match outcome {
            AddOutcome::Added => {
                tracing::trace!(peer = %from, chunk = chunk.id, hops = chunk.attributes.hopcount, "chunk received")
            }
            AddOutcome::Old => tracing::debug!(peer = %from, chunk = chunk.id, "chunk too old"),
            AddOutcome::Duplicate => tracing::debug!(peer = %from, chunk = chunk.id, "chunk duplicated"),
        }

        if let Some(peer) = self.topology.resolve_peer(from, false) {
            let mut view = lock(&peer);
            view.bmap.insert(chunk.id);
            view.bmap_timestamp = Some(Instant::now());
        }
        self.send_signal(from, &Signal::Ack { trans_id, ids: own })?;
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Advertise our holdings to one neighbour.
    pub fn send_bmap(&self, to: &PeerId) -> Result<(), StreamError> {
        let signal = Signal::BufferMap {
            capacity: self.declared_capacity(),
            ids: self.buffer_map(),
        };
        self.send_signal(to, &signal)?;
        Ok(())
    }

    /// Advertise our holdings to every neighbour. Returns how many got it.
    pub fn broadcast_bmap(&self) -> usize {
        let ids: Vec<PeerId> = self.topology.neighbours().iter().map(|p| lock(p).id).collect();
        let mut sent = 0;
        for id in ids {
            match self.send_bmap(&id) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(peer = %id, error = %e, "buffer map send failed"),
            }
        }
        sent
    }

    /// One offer round: pick neighbours that lack something we hold and
    /// offer them our recent chunks. Returns the number of offers sent.
    pub fn send_offer(&self) -> Result<usize, StreamError> {
        let neighbours = self.topology.neighbours();
        if neighbours.is_empty() {
            return Ok(0);
        }
        let now_us = now_micros();

        let (offer, candidates) = {
            let ex = lock(&self.exchange);
            let offer = self.compose_offer(&ex.buffer);
            if offer.is_empty() {
                return Ok(0);
            }
            let mut candidates = Vec::new();
            for peer in &neighbours {
                let view = lock(peer);
                let wanted = offer.iter().any(|id| {
                    self.policy
                        .needs(&view.bmap, view.capacity, id, ex.buffer.timestamp_of(id), now_us)
                });
                if wanted {
                    candidates.push((view.id, view.weight()));
                }
            }
            (offer, candidates)
        };

        let selected = select_weighted(candidates, self.config.offers_per_tick as usize, &mut rand::thread_rng());
        let mut sent = 0;
        for to in selected {
            let trans_id = lock(&self.control).registry.create(to, Instant::now());
            let signal = Signal::Offer {
                trans_id,
                max_deliver: self.config.chunks_per_offer,
                ids: offer.clone(),
            };
            match self.send_signal(&to, &signal) {
                Ok(_) => {
                    tracing::trace!(peer = %to, trans_id, offered = offer.len(), "offer sent");
                    self.telemetry.offer_sent(&to, offer.len());
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %to, error = %e, "offer send failed");
                    lock(&self.control).registry.retire(trans_id);
                }
            }
        }
        Ok(sent)
    }

    /// Chunks worth offering, newest first. Chunks within the offer horizon
    /// of the oldest one are about to be evicted; the source also holds
    /// back its newest quarter so relays get to spread it first.
    fn compose_offer(&self, buffer: &ChunkBuffer) -> BufferMap {
        let chunks: Vec<&Chunk> = buffer.chunks().collect();
        let Some(oldest) = chunks.first() else {
            return BufferMap::new();
        };
        let horizon = oldest.timestamp_us + self.config.offer_horizon.as_micros() as u64;
        let last = match self.config.role {
            Role::Source => (chunks.len() - 1) * 3 / 4,
            Role::Relay => chunks.len() - 1,
        };
        chunks[..=last]
            .iter()
            .rev()
            .filter(|c| c.timestamp_us >= horizon)
            .map(|c| c.id)
            .collect()
    }

    /// Push one chunk without negotiation: the newest chunk some weighted
    /// random neighbour still needs. Returns false if nobody needs anything.
    pub fn send_chunk(&self) -> Result<bool, StreamError> {
        let neighbours = self.topology.neighbours();
        if neighbours.is_empty() {
            return Ok(false);
        }
        let now_us = now_micros();

        let mut ex = lock(&self.exchange);
        let mut candidates = Vec::new();
        for peer in &neighbours {
            let view = lock(peer);
            let newest_needed = ex.buffer.chunks().rev().find(|c| {
                self.policy
                    .needs(&view.bmap, view.capacity, c.id, Some(c.timestamp_us), now_us)
            });
            if let Some(c) = newest_needed {
                candidates.push(((peer.clone(), c.id), view.weight()));
            }
        }

        let Some((peer, id)) = select_weighted(candidates, 1, &mut rand::thread_rng()).pop() else {
            return Ok(false);
        };
        let Some(stored) = ex.buffer.get_mut(id) else {
            return Ok(false);
        };
        stored.advance_for_send();
        let chunk = stored.clone();
        let to = lock(&peer).id;

        let trans_id = lock(&self.control).registry.create(to, Instant::now());
        if let Err(e) = self.send_chunk_to(&to, &chunk, trans_id) {
            lock(&self.control).registry.retire(trans_id);
            return Err(e);
        }
        lock(&peer).bmap.insert(id);
        self.telemetry.chunk_sent(&to, id);
        Ok(true)
    }

    // ── Source role ──────────────────────────────────────────────────────────

    /// Pull the next chunk from `source` into our buffer.
    pub fn generate_chunk(&self, source: &mut dyn ChunkSource) -> Result<Option<Chunk>, StreamError> {
        let Some(item) = source.next_item()? else {
            return Ok(None);
        };
        Ok(Some(self.ingest(item)))
    }

    /// Number an input item if needed and store it as our newest chunk.
    pub fn ingest(&self, item: SourceItem) -> Chunk {
        let mut ex = lock(&self.exchange);
        let chunk = match item {
            SourceItem::Payload(payload) => {
                let chunk = Chunk::new(ex.next_id, now_micros(), payload);
                ex.next_id = ex.next_id.wrapping_add(1);
                chunk
            }
            SourceItem::Chunk(chunk) => {
                ex.next_id = ex.next_id.max(chunk.id.wrapping_add(1));
                chunk
            }
        };
        match ex.buffer.add(chunk.clone()) {
            AddOutcome::Added => tracing::trace!(chunk = chunk.id, size = chunk.size(), "chunk generated"),
            other => tracing::warn!(chunk = chunk.id, outcome = ?other, "generated chunk not buffered"),
        }
        chunk
    }

    /// Push a freshly generated chunk to `source_multiplicity` neighbours.
    pub fn inject_chunk(&self, id: u32) -> Result<usize, StreamError> {
        let neighbours = self.topology.neighbours();
        let now_us = now_micros();

        let mut ex = lock(&self.exchange);
        let Some(timestamp) = ex.buffer.timestamp_of(id) else {
            return Ok(0);
        };
        let candidates: Vec<(SharedPeer, f64)> = neighbours
            .iter()
            .filter_map(|peer| {
                let view = lock(peer);
                self.policy
                    .needs(&view.bmap, view.capacity, id, Some(timestamp), now_us)
                    .then(|| (peer.clone(), view.weight()))
            })
            .collect();
        let selected = select_weighted(candidates, self.config.source_multiplicity as usize, &mut rand::thread_rng());

        let mut sent = 0;
        for peer in selected {
            let Some(stored) = ex.buffer.get_mut(id) else {
                break;
            };
            stored.advance_for_send();
            let chunk = stored.clone();
            let to = lock(&peer).id;
            let trans_id = lock(&self.control).registry.create(to, Instant::now());
            match self.send_chunk_to(&to, &chunk, trans_id) {
                Ok(_) => {
                    lock(&peer).bmap.insert(id);
                    self.telemetry.chunk_sent(&to, id);
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %to, chunk = id, error = %e, "chunk push failed");
                    lock(&self.control).registry.retire(trans_id);
                }
            }
        }
        Ok(sent)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn send_signal(&self, to: &PeerId, signal: &Signal) -> Result<usize, StreamError> {
        Ok(self.transport.send_to(to, &wire::encode_signal(signal))?)
    }

    fn send_chunk_to(&self, to: &PeerId, chunk: &Chunk, trans_id: u16) -> Result<usize, StreamError> {
        let bytes = wire::encode_chunk(chunk, trans_id)?;
        Ok(self.transport.send_to(to, &bytes)?)
    }
}
