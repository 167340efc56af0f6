//! Telemetry — fire-and-forget measurement hooks and the default collector.
//!
//! The protocol engine calls every hook unconditionally. All hooks default
//! to no-ops so a sink only overrides what it records. `Measures` is the
//! collector the daemon installs: global counters plus per-peer reception
//! quality, summarised periodically as a structured log line.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use meshcast_core::{now_micros, PeerId};

use crate::chunk_buffer::AddOutcome;
use crate::lock;

/// Weight of a new sample in the per-peer moving averages.
const SAMPLE_WEIGHT: f64 = 0.01;
/// Reception rate is kept within [MIN_RATE_VALUE, 1 - MIN_RATE_VALUE].
const MIN_RATE_VALUE: f64 = 0.1;

pub trait Telemetry: Send + Sync {
    fn offer_sent(&self, _peer: &PeerId, _offered: usize) {}
    /// An offer arrived and was answered. `accepted` = non-empty answer.
    fn offer_accept_in(&self, _peer: &PeerId, _accepted: bool) {}
    /// An accept arrived for one of our offers.
    fn offer_accept_out(&self, _peer: &PeerId, _accepted: bool) {}
    fn offer_accept_rtt(&self, _peer: &PeerId, _rtt: Duration) {}
    /// The peer answered within the transaction lifetime.
    fn reception_sample(&self, _peer: &PeerId) {}
    /// A transaction with this peer expired unanswered.
    fn reception_timeout(&self, _peer: &PeerId) {}
    fn chunk_sent(&self, _peer: &PeerId, _id: u32) {}
    fn chunk_received(&self, _id: u32, _timestamp_us: u64, _hopcount: u16, _outcome: AddOutcome) {}
    /// Playout saw a chunk it already holds.
    fn chunk_duplicate(&self, _id: u32) {}
    /// A chunk was played out (`hit`) or skipped as lost.
    fn playout(&self, _id: u32, _timestamp_us: u64, _hit: bool) {}
    /// `count` consecutive ids from `first` were skipped without ever
    /// entering the playout window.
    fn playout_gap(&self, _first: u32, _count: u64) {}
    fn queue_delay(&self, _delay: Duration) {}
    fn period(&self, _period: Duration) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {}

// ── Measures ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    pub chunks_received: u64,
    pub chunks_received_old: u64,
    pub chunks_received_dup: u64,
    pub chunks_sent: u64,
    pub chunks_played: u64,
    pub chunks_lost: u64,
    pub playout_duplicates: u64,
    pub offers_sent: u64,
    pub offers_in: u64,
    pub offers_in_accepted: u64,
    pub accepts_in: u64,
    pub accepts_in_nonempty: u64,
    pub transaction_timeouts: u64,
    pub hopcount_sum: u64,
    pub receive_delay_sum_us: u64,
    pub playout_delay_sum_us: u64,
    pub queue_delay_samples: u64,
    pub queue_delay_sum_us: u64,
    pub last_period_us: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PeerStats {
    pub reception_rate: f64,
    /// None until the first accept arrives.
    pub offer_accept_rtt_us: Option<f64>,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            reception_rate: 1.0 - MIN_RATE_VALUE,
            offer_accept_rtt_us: None,
        }
    }
}

impl PeerStats {
    fn hit(&mut self) {
        self.reception_rate = (SAMPLE_WEIGHT + self.reception_rate * (1.0 - SAMPLE_WEIGHT))
            .min(1.0 - MIN_RATE_VALUE);
    }

    fn miss(&mut self) {
        self.reception_rate = (self.reception_rate * (1.0 - SAMPLE_WEIGHT)).max(MIN_RATE_VALUE);
    }

    fn rtt(&mut self, sample_us: f64) {
        self.offer_accept_rtt_us = Some(match self.offer_accept_rtt_us {
            Some(prev) => sample_us * SAMPLE_WEIGHT + prev * (1.0 - SAMPLE_WEIGHT),
            None => sample_us,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer: String,
    #[serde(flatten)]
    pub stats: PeerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasuresSnapshot {
    #[serde(flatten)]
    pub counters: Counters,
    pub peers: Vec<PeerSnapshot>,
}

/// Shared measurement collector.
#[derive(Clone, Default)]
pub struct Measures {
    counters: Arc<Mutex<Counters>>,
    peers: Arc<DashMap<PeerId, PeerStats>>,
}

impl Measures {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut lock(&self.counters));
    }

    pub fn counters(&self) -> Counters {
        lock(&self.counters).clone()
    }

    pub fn peer(&self, peer: &PeerId) -> Option<PeerStats> {
        self.peers.get(peer).map(|s| *s)
    }

    /// Drop the per-peer averages of a peer that left.
    pub fn forget_peer(&self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn snapshot(&self) -> MeasuresSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|e| PeerSnapshot {
                peer: e.key().to_string(),
                stats: *e.value(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        MeasuresSnapshot {
            counters: self.counters(),
            peers,
        }
    }

    /// Emit the current snapshot as one structured log line.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        let c = &snapshot.counters;
        let received = c.chunks_received.max(1);
        tracing::info!(
            received = c.chunks_received,
            played = c.chunks_played,
            lost = c.chunks_lost,
            sent = c.chunks_sent,
            duplicates = c.chunks_received_dup,
            avg_hopcount = c.hopcount_sum as f64 / received as f64,
            period_us = c.last_period_us,
            "measures summary"
        );
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::debug!(snapshot = %json, "measures snapshot"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize measures"),
        }
    }
}

impl Telemetry for Measures {
    fn offer_sent(&self, _peer: &PeerId, _offered: usize) {
        self.update(|c| c.offers_sent += 1);
    }

    fn offer_accept_in(&self, _peer: &PeerId, accepted: bool) {
        self.update(|c| {
            c.offers_in += 1;
            c.offers_in_accepted += u64::from(accepted);
        });
    }

    fn offer_accept_out(&self, _peer: &PeerId, accepted: bool) {
        self.update(|c| {
            c.accepts_in += 1;
            c.accepts_in_nonempty += u64::from(accepted);
        });
    }

    fn offer_accept_rtt(&self, peer: &PeerId, rtt: Duration) {
        self.peers
            .entry(*peer)
            .or_default()
            .rtt(rtt.as_micros() as f64);
    }

    fn reception_sample(&self, peer: &PeerId) {
        self.peers.entry(*peer).or_default().hit();
    }

    fn reception_timeout(&self, peer: &PeerId) {
        self.peers.entry(*peer).or_default().miss();
        self.update(|c| c.transaction_timeouts += 1);
    }

    fn chunk_sent(&self, _peer: &PeerId, _id: u32) {
        self.update(|c| c.chunks_sent += 1);
    }

    fn chunk_received(&self, _id: u32, timestamp_us: u64, hopcount: u16, outcome: AddOutcome) {
        let delay = now_micros().saturating_sub(timestamp_us);
        self.update(|c| {
            c.chunks_received += 1;
            match outcome {
                AddOutcome::Added => {}
                AddOutcome::Old => c.chunks_received_old += 1,
                AddOutcome::Duplicate => c.chunks_received_dup += 1,
            }
            c.hopcount_sum += u64::from(hopcount);
            c.receive_delay_sum_us += delay;
        });
    }

    fn chunk_duplicate(&self, _id: u32) {
        self.update(|c| c.playout_duplicates += 1);
    }

    fn playout(&self, _id: u32, timestamp_us: u64, hit: bool) {
        let delay = now_micros().saturating_sub(timestamp_us);
        self.update(|c| {
            if hit {
                c.chunks_played += 1;
                c.playout_delay_sum_us += delay;
            } else {
                c.chunks_lost += 1;
            }
        });
    }

    fn playout_gap(&self, _first: u32, count: u64) {
        self.update(|c| c.chunks_lost += count);
    }

    fn queue_delay(&self, delay: Duration) {
        self.update(|c| {
            c.queue_delay_samples += 1;
            c.queue_delay_sum_us += delay.as_micros() as u64;
        });
    }

    fn period(&self, period: Duration) {
        self.update(|c| c.last_period_us = period.as_micros() as u64);
    }
}
