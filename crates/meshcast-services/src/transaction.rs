//! Transaction registry — correlates offers, accepts, deliveries and acks.
//!
//! Every offer and every delivered chunk gets a 16-bit transaction id. The
//! registry remembers when it was sent and when the matching accept came
//! back, so an ack can be turned into a queueing-delay sample for rate
//! control. Entries older than the lifetime are swept with a timeout
//! sample for their peer.
//!
//! Entries live in a map keyed by id. A second, creation-ordered queue makes
//! sweeping proportional to the number of expired entries; queue slots whose
//! entry was already removed (or whose id was reused) are skipped lazily.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcast_core::PeerId;

use crate::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u16,
    pub peer: PeerId,
    pub sent_at: Instant,
    pub accepted_at: Option<Instant>,
}

/// Result of consuming a transaction on ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Time from accept to ack.
    QueueDelay(Duration),
    /// The transaction existed but no accept was ever registered.
    Unaccepted,
    /// Unknown, already consumed, or swept.
    NotFound,
}

pub struct TransactionRegistry {
    lifetime: Duration,
    last_id: u16,
    entries: HashMap<u16, Transaction>,
    /// (id, sent_at), oldest first.
    order: VecDeque<(u16, Instant)>,
    telemetry: Arc<dyn Telemetry>,
}

impl TransactionRegistry {
    pub fn new(lifetime: Duration, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            lifetime,
            last_id: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            telemetry,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&Transaction> {
        self.entries.get(&id)
    }

    /// Open a transaction for an offer to `peer`. Sweeps expired entries first.
    pub fn create(&mut self, peer: PeerId, now: Instant) -> u16 {
        self.insert(peer, None, now)
    }

    /// Open a transaction for one chunk delivered in answer to an accept.
    /// It inherits the accept time so its ack yields a queueing delay.
    pub fn create_delivery(&mut self, peer: PeerId, accepted_at: Instant, now: Instant) -> u16 {
        self.insert(peer, Some(accepted_at), now)
    }

    fn insert(&mut self, peer: PeerId, accepted_at: Option<Instant>, now: Instant) -> u16 {
        self.sweep_expired(now);
        let id = self.allocate_id();
        self.entries.insert(
            id,
            Transaction {
                id,
                peer,
                sent_at: now,
                accepted_at,
            },
        );
        self.order.push_back((id, now));
        id
    }

    /// Next non-zero id not currently live. Wraps on overflow.
    fn allocate_id(&mut self) -> u16 {
        for _ in 0..u16::MAX {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                continue;
            }
            if !self.entries.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
        // Every id is live: give up the oldest one.
        let oldest = self.pop_oldest_live().unwrap_or(1);
        tracing::warn!(trans_id = oldest, "transaction ids exhausted, reusing oldest");
        self.last_id = oldest;
        oldest
    }

    fn pop_oldest_live(&mut self) -> Option<u16> {
        while let Some((id, sent_at)) = self.order.pop_front() {
            if self.is_current(id, sent_at) {
                if let Some(t) = self.entries.remove(&id) {
                    self.telemetry.reception_timeout(&t.peer);
                }
                return Some(id);
            }
        }
        None
    }

    fn is_current(&self, id: u16, sent_at: Instant) -> bool {
        self.entries.get(&id).is_some_and(|t| t.sent_at == sent_at)
    }

    /// Stamp the accept time. Returns false for unknown or foreign ids.
    ///
    /// Ids are 16-bit and shared by every neighbour, so an accept only
    /// counts when it comes from the peer the offer went to.
    pub fn register_accept(&mut self, id: u16, peer: &PeerId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(t) if t.peer == *peer => {
                t.accepted_at = Some(now);
                let rtt = now.saturating_duration_since(t.sent_at);
                self.telemetry.offer_accept_rtt(peer, rtt);
                self.telemetry.reception_sample(peer);
                true
            }
            Some(t) => {
                tracing::debug!(trans_id = id, expected = %t.peer, from = %peer, "accept from unexpected peer");
                false
            }
            None => {
                tracing::debug!(trans_id = id, peer = %peer, "accept for unknown transaction");
                false
            }
        }
    }

    /// Remove the transaction an ack refers to.
    pub fn consume_on_ack(&mut self, id: u16, now: Instant) -> AckOutcome {
        let Some(t) = self.entries.remove(&id) else {
            return AckOutcome::NotFound;
        };
        self.telemetry.reception_sample(&t.peer);
        match t.accepted_at {
            Some(at) => AckOutcome::QueueDelay(now.saturating_duration_since(at)),
            None => AckOutcome::Unaccepted,
        }
    }

    /// Drop a transaction without reporting anything.
    pub fn retire(&mut self, id: u16) -> Option<Transaction> {
        self.entries.remove(&id)
    }

    /// Remove every entry older than the lifetime, reporting a timeout for
    /// each. Returns how many were removed.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(&(id, sent_at)) = self.order.front() {
            if now.saturating_duration_since(sent_at) <= self.lifetime {
                break;
            }
            self.order.pop_front();
            if !self.is_current(id, sent_at) {
                continue;
            }
            if let Some(t) = self.entries.remove(&id) {
                tracing::debug!(trans_id = id, peer = %t.peer, "transaction timed out");
                self.telemetry.reception_timeout(&t.peer);
                removed += 1;
            }
        }
        removed
    }
}
