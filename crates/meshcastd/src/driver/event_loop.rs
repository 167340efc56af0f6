//! Single-task driver. Each wake handles exactly one event: a datagram,
//! the offer timer, the production timer or the gossip timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use meshcast_core::config::MeshcastConfig;
use meshcast_services::{Measures, PeerTable, StreamingSession, Transport};

use crate::input::SourceFeed;
use crate::net::Dispatcher;
use crate::topology;

pub struct EventLoop {
    session: Arc<StreamingSession>,
    table: PeerTable,
    measures: Measures,
    transport: Arc<dyn Transport>,
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    feed: Option<SourceFeed>,
    buf_size: usize,
    pushes_per_tick: u32,
    chunk_interval: Duration,
    hello_interval: Duration,
    neighbour_ttl: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &MeshcastConfig,
        session: Arc<StreamingSession>,
        table: PeerTable,
        measures: Measures,
        transport: Arc<dyn Transport>,
        socket: Arc<UdpSocket>,
        dispatcher: Arc<Dispatcher>,
        feed: Option<SourceFeed>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session,
            table,
            measures,
            transport,
            socket,
            dispatcher,
            feed,
            buf_size: config.network.recv_buffer,
            pushes_per_tick: config.stream.pushes_per_tick,
            chunk_interval: config.stream.initial_period(),
            hello_interval: Duration::from_millis(config.topology.hello_interval_ms.max(1)),
            neighbour_ttl: Duration::from_millis(config.topology.neighbour_ttl_ms),
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.buf_size];
        let mut next_offer = Instant::now() + self.session.period();
        let mut chunk_timer = time::interval(self.chunk_interval);
        chunk_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gossip_timer = time::interval(self.hello_interval);

        tracing::info!(source = self.feed.is_some(), "event loop starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("event loop shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.dispatcher.handle(from, &buf[..len]),
                        Err(e) => tracing::warn!(error = %e, "recv_from failed"),
                    }
                }

                _ = time::sleep_until(next_offer) => {
                    super::offer_tick(&self.session, self.pushes_per_tick);
                    next_offer = Instant::now() + self.session.period();
                }

                _ = chunk_timer.tick(), if self.feed.is_some() => {
                    let done = match self.feed.as_mut() {
                        Some(feed) => !super::produce_tick(&self.session, feed),
                        None => false,
                    };
                    if done {
                        self.feed = None;
                    }
                }

                _ = gossip_timer.tick() => {
                    topology::gossip_round(&self.session, &self.table, self.transport.as_ref());
                    topology::expire_neighbours(
                        &self.table,
                        &self.measures,
                        self.neighbour_ttl,
                        std::time::Instant::now(),
                    );
                }
            }
        }
    }
}
