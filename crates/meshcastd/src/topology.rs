//! Neighbour maintenance — hello gossip and expiry.
//!
//! Every `hello_interval` each neighbour gets a hello (our role and declared
//! capacity) followed by our buffer map. Dynamic neighbours not heard from
//! within `neighbour_ttl` are dropped; configured ones stay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;

use meshcast_core::wire::{self, Hello};
use meshcast_services::{Measures, PeerTable, Role, StreamingSession, Transport};

/// Send one round of hellos and buffer maps. Returns hellos sent.
pub fn gossip_round(session: &StreamingSession, table: &PeerTable, transport: &dyn Transport) -> usize {
    let hello = wire::encode_hello(&Hello {
        source: session.role() == Role::Source,
        capacity: session.declared_capacity(),
    });
    let mut sent = 0;
    for peer in table.ids() {
        match transport.send_to(&peer, &hello) {
            Ok(_) => sent += 1,
            Err(e) => tracing::warn!(peer = %peer, error = %e, "hello send failed"),
        }
    }
    session.broadcast_bmap();
    sent
}

pub struct GossipWorker {
    session: Arc<StreamingSession>,
    table: PeerTable,
    transport: Arc<dyn Transport>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl GossipWorker {
    pub fn new(
        session: Arc<StreamingSession>,
        table: PeerTable,
        transport: Arc<dyn Transport>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session,
            table,
            transport,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "topology gossip starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("topology gossip shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    let sent = gossip_round(&self.session, &self.table, self.transport.as_ref());
                    tracing::trace!(neighbours = sent, "gossip round");
                }
            }
        }
    }
}

/// Drop silent dynamic neighbours along with their measures.
pub fn expire_neighbours(table: &PeerTable, measures: &Measures, ttl: Duration, now: Instant) -> usize {
    let removed = table.expire(ttl, now);
    for peer in &removed {
        measures.forget_peer(peer);
    }
    removed.len()
}

/// Remove dynamic neighbours that went silent.
///
/// Runs forever; cancel by dropping the task handle.
pub async fn expiry_loop(table: PeerTable, measures: Measures, ttl: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        expire_neighbours(&table, &measures, ttl, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use meshcast_core::wire::MessageKind;
    use meshcast_core::PeerId;
    use meshcast_services::{MemorySink, NoTelemetry, SessionConfig, Telemetry, TransportError};

    #[derive(Default)]
    struct Capture(Mutex<Vec<(PeerId, Vec<u8>)>>);

    impl Transport for Capture {
        fn send_to(&self, peer: &PeerId, bytes: &[u8]) -> Result<usize, TransportError> {
            self.0.lock().unwrap().push((*peer, bytes.to_vec()));
            Ok(bytes.len())
        }
    }

    #[test]
    fn gossip_sends_hello_then_buffer_map() {
        let table = PeerTable::new();
        let a: PeerId = "127.0.0.1:7001".parse().unwrap();
        table.add_pinned(a);
        let transport = Arc::new(Capture::default());
        let session = StreamingSession::new(
            SessionConfig {
                role: Role::Source,
                ..SessionConfig::default()
            },
            Arc::new(table.clone()),
            transport.clone(),
            Arc::new(NoTelemetry),
            Box::new(MemorySink::new()),
        );

        assert_eq!(gossip_round(&session, &table, transport.as_ref()), 1);

        let sent = transport.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let hello = wire::decode_hello(&sent[0].1).unwrap();
        assert!(hello.source);
        assert_eq!(hello.capacity, 0);
        assert_eq!(wire::message_kind(&sent[1].1).unwrap(), MessageKind::Signaling);
    }

    #[test]
    fn expired_neighbours_lose_their_measures() {
        let table = PeerTable::new();
        let measures = Measures::new();
        let pinned: PeerId = "127.0.0.1:7001".parse().unwrap();
        let silent: PeerId = "127.0.0.1:7002".parse().unwrap();
        let t0 = Instant::now();
        table.add_pinned(pinned);
        table.touch(silent, t0);
        measures.reception_sample(&pinned);
        measures.reception_sample(&silent);

        let ttl = Duration::from_secs(10);
        assert_eq!(expire_neighbours(&table, &measures, ttl, t0 + Duration::from_secs(5)), 0);
        assert!(measures.peer(&silent).is_some());

        assert_eq!(expire_neighbours(&table, &measures, ttl, t0 + Duration::from_secs(11)), 1);
        assert!(measures.peer(&silent).is_none());
        assert!(measures.peer(&pinned).is_some());
        assert_eq!(measures.snapshot().peers.len(), 1);
    }
}
