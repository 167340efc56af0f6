//! Worker-pool driver: one task per concern, joined by a shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use meshcast_services::StreamingSession;

use crate::input::SourceFeed;
use crate::net::Dispatcher;

/// Reads datagrams off the socket and hands them to the dispatcher.
pub struct ReceiveWorker {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    buf_size: usize,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiveWorker {
    pub fn new(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<Dispatcher>,
        buf_size: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            dispatcher,
            buf_size,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.buf_size];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("receive worker shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.dispatcher.handle(from, &buf[..len]);
                }
            }
        }
    }
}

/// Offers (and optionally pushes) at the period rate control picks.
pub struct OfferWorker {
    session: Arc<StreamingSession>,
    pushes_per_tick: u32,
    shutdown: broadcast::Receiver<()>,
}

impl OfferWorker {
    pub fn new(session: Arc<StreamingSession>, pushes_per_tick: u32, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            session,
            pushes_per_tick,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(period_us = self.session.period().as_micros() as u64, "offer worker starting");

        loop {
            // Re-read every round: rate control moves it.
            let period = self.session.period();
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("offer worker shutting down");
                    return Ok(());
                }

                _ = tokio::time::sleep(period) => {
                    super::offer_tick(&self.session, self.pushes_per_tick);
                }
            }
        }
    }
}

/// Pulls chunks from the stream input at the production rate.
pub struct SourceWorker {
    session: Arc<StreamingSession>,
    feed: SourceFeed,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SourceWorker {
    pub fn new(
        session: Arc<StreamingSession>,
        feed: SourceFeed,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session,
            feed,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_us = self.interval.as_micros() as u64, "source worker starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("source worker shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    if !super::produce_tick(&self.session, &mut self.feed) {
                        break;
                    }
                }
            }
        }

        // Input is done; keep relaying until shutdown.
        let _ = self.shutdown.recv().await;
        Ok(())
    }
}
