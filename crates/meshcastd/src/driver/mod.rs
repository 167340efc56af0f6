//! Drivers — what makes the engine move.
//!
//! `workers` runs reception, offering, gossip and production as separate
//! tasks. `event_loop` runs them all from one task that wakes on whichever
//! of socket or timers is ready first. Both share the tick bodies below.

use meshcast_services::StreamingSession;

use crate::input::{Feed, SourceFeed};

pub mod event_loop;
pub mod workers;

/// One offer period: expire transactions, offer, then push.
pub(crate) fn offer_tick(session: &StreamingSession, pushes: u32) {
    let expired = session.sweep_transactions();
    if expired > 0 {
        tracing::debug!(expired, "transactions timed out");
    }
    match session.send_offer() {
        Ok(n) => tracing::trace!(offers = n, period_us = session.period().as_micros() as u64, "offer tick"),
        Err(e) => tracing::warn!(error = %e, "offer round failed"),
    }
    for _ in 0..pushes {
        match session.send_chunk() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(error = %e, "chunk push failed");
                break;
            }
        }
    }
}

/// Produce one chunk and push it out. Returns false once the input is done.
///
/// An input that has nothing ready yet skips the tick.
pub(crate) fn produce_tick(session: &StreamingSession, feed: &mut SourceFeed) -> bool {
    match feed.poll_item() {
        Feed::Item(item) => {
            let chunk = session.ingest(item);
            match session.inject_chunk(chunk.id) {
                Ok(n) => tracing::trace!(chunk = chunk.id, pushed = n, "chunk injected"),
                Err(e) => tracing::warn!(chunk = chunk.id, error = %e, "chunk injection failed"),
            }
            true
        }
        Feed::Pending => {
            tracing::trace!("stream input not ready");
            true
        }
        Feed::Done => {
            tracing::info!("stream input exhausted");
            false
        }
        Feed::Failed(e) => {
            tracing::error!(error = %e, "stream input failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::UdpSocket;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;

    use meshcast_core::config::{MeshcastConfig, NetworkConfig};
    use meshcast_core::PeerId;
    use meshcast_services::{ChunkSink, Measures, MemorySink, PeerTable, Role, SessionConfig, Transport};

    use crate::input::{spawn_reader, RawSource};
    use crate::net::{make_socket, Dispatcher, UdpTransport};
    use crate::output::spawn_writer;
    use crate::topology::GossipWorker;
    use super::event_loop::EventLoop;
    use super::workers::{OfferWorker, ReceiveWorker, SourceWorker};

    type Task = (&'static str, JoinHandle<anyhow::Result<()>>);

    struct Node {
        id: PeerId,
        socket: Arc<UdpSocket>,
        transport: Arc<dyn Transport>,
        table: PeerTable,
        measures: Measures,
    }

    impl Node {
        fn bind() -> Self {
            let socket = make_socket(&NetworkConfig {
                bind: "127.0.0.1".into(),
                port: 0,
                ..NetworkConfig::default()
            })
            .unwrap();
            let addr = socket.local_addr().unwrap().as_socket().unwrap();
            let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(socket.try_clone().unwrap()));
            Self {
                id: PeerId::new(addr),
                socket: Arc::new(UdpSocket::from_std(socket.into()).unwrap()),
                transport,
                table: PeerTable::new(),
                measures: Measures::new(),
            }
        }

        fn session(&self, role: Role, sink: Box<dyn ChunkSink>) -> Arc<StreamingSession> {
            Arc::new(StreamingSession::new(
                SessionConfig {
                    role,
                    offer_horizon: Duration::ZERO,
                    source_multiplicity: 1,
                    ..SessionConfig::default()
                },
                Arc::new(self.table.clone()),
                self.transport.clone(),
                Arc::new(self.measures.clone()),
                sink,
            ))
        }

        fn dispatcher(&self, session: &Arc<StreamingSession>) -> Arc<Dispatcher> {
            Arc::new(Dispatcher::new(session.clone(), self.table.clone(), false))
        }
    }

    fn raw_feed(chunks: usize) -> SourceFeed {
        spawn_reader(Box::new(RawSource::new(Cursor::new(vec![1u8; chunks * 4]), 4)), 4)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    async fn join_all(tasks: Vec<Task>) {
        for (name, task) in tasks {
            let joined = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap_or_else(|_| panic!("{name} ignored shutdown"));
            joined.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_feed_an_event_loop_relay_until_shutdown() {
        let source = Node::bind();
        let relay = Node::bind();
        source.table.add_pinned(relay.id);
        relay.table.add_pinned(source.id);

        let source_session = source.session(Role::Source, Box::new(MemorySink::new()));
        let played = MemorySink::new();
        let (relay_sink, writer) = spawn_writer(Box::new(played.clone()), 64);
        let relay_session = relay.session(Role::Relay, Box::new(relay_sink));

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let tasks: Vec<Task> = vec![
            (
                "receive worker",
                tokio::spawn(
                    ReceiveWorker::new(
                        source.socket.clone(),
                        source.dispatcher(&source_session),
                        65_536,
                        shutdown_tx.subscribe(),
                    )
                    .run(),
                ),
            ),
            (
                "offer worker",
                tokio::spawn(OfferWorker::new(source_session.clone(), 0, shutdown_tx.subscribe()).run()),
            ),
            (
                "source worker",
                tokio::spawn(
                    SourceWorker::new(
                        source_session.clone(),
                        raw_feed(10),
                        Duration::from_millis(5),
                        shutdown_tx.subscribe(),
                    )
                    .run(),
                ),
            ),
            (
                "gossip worker",
                tokio::spawn(
                    GossipWorker::new(
                        source_session.clone(),
                        source.table.clone(),
                        source.transport.clone(),
                        Duration::from_millis(20),
                        shutdown_tx.subscribe(),
                    )
                    .run(),
                ),
            ),
            (
                "event loop",
                tokio::spawn(
                    EventLoop::new(
                        &MeshcastConfig::default(),
                        relay_session.clone(),
                        relay.table.clone(),
                        relay.measures.clone(),
                        relay.transport.clone(),
                        relay.socket.clone(),
                        relay.dispatcher(&relay_session),
                        None,
                        shutdown_tx.subscribe(),
                    )
                    .run(),
                ),
            ),
        ];

        assert!(wait_for(|| played.ids().len() >= 10).await, "relay played {:?}", played.ids());
        assert_eq!(played.ids(), (0..10).collect::<Vec<u32>>());
        assert!(source.measures.counters().chunks_sent >= 10);
        assert!(relay.measures.counters().chunks_received >= 10);
        for (name, task) in &tasks {
            assert!(!task.is_finished(), "{name} stopped before shutdown");
        }

        shutdown_tx.send(()).unwrap();
        join_all(tasks).await;

        // The relay session was the writer's last producer.
        drop(relay_session);
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("output writer did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_source_worker_waits_for_shutdown() {
        let node = Node::bind();
        let session = node.session(Role::Source, Box::new(MemorySink::new()));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let task = tokio::spawn(
            SourceWorker::new(session.clone(), raw_feed(3), Duration::from_millis(2), shutdown_tx.subscribe()).run(),
        );

        assert!(wait_for(|| session.buffer_map().len() == 3).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(session.buffer_map().len(), 3);

        shutdown_tx.send(()).unwrap();
        join_all(vec![("source worker", task)]).await;
    }
}
