//! meshcastd — meshcast live-streaming peer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use meshcast_core::config::{DriverMode, MeshcastConfig};
use meshcast_core::PeerId;
use meshcast_services::{Measures, PeerTable, SessionConfig, StreamingSession, Transport};

mod driver;
mod input;
mod net;
mod output;
mod topology;

use driver::event_loop::EventLoop;
use driver::workers::{OfferWorker, ReceiveWorker, SourceWorker};
use net::{Dispatcher, UdpTransport};
use topology::GossipWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Load config
    if let Err(e) = MeshcastConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshcastConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshcastConfig::default()
    });

    // Socket and transport
    let socket = net::make_socket(&config.network).context("failed to create peer socket")?;
    let send_socket = socket.try_clone().context("failed to duplicate peer socket")?;
    let socket = Arc::new(
        UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?,
    );
    tracing::info!(addr = %socket.local_addr()?, driver = ?config.network.driver, "meshcastd starting");
    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(send_socket));

    // Neighbours
    let table = PeerTable::new();
    for peer in &config.network.peers {
        match peer.parse::<PeerId>() {
            Ok(id) => {
                table.add_pinned(id);
            }
            Err(e) => tracing::warn!(peer, error = %e, "ignoring invalid neighbour address"),
        }
    }

    // Engine
    let measures = Measures::new();
    let feed = input::open_source(&config.source)?.map(|s| input::spawn_reader(s, input::READ_AHEAD));
    let (sink, _writer) = output::spawn_writer(output::open_sink(&config.output)?, output::WRITE_BEHIND);
    let session_config = SessionConfig::from_config(&config);
    tracing::info!(
        role = ?session_config.role,
        buffer = session_config.buffer_size,
        window = session_config.playout_window,
        neighbours = table.len(),
        "streaming session ready"
    );
    let session = Arc::new(StreamingSession::new(
        session_config,
        Arc::new(table.clone()),
        transport.clone(),
        Arc::new(measures.clone()),
        Box::new(sink),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        session.clone(),
        table.clone(),
        config.topology.register_unknown,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Background tasks ─────────────────────────────────────────────────────

    let _expiry_task = tokio::spawn(topology::expiry_loop(
        table.clone(),
        measures.clone(),
        Duration::from_millis(config.topology.neighbour_ttl_ms),
    ));

    let _stats_printer = (config.telemetry.summary_interval_secs > 0).then(|| {
        let measures = measures.clone();
        let every = Duration::from_secs(config.telemetry.summary_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                measures.log_summary();
            }
        })
    });

    // ── Drivers ──────────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    match config.network.driver {
        DriverMode::EventLoop => {
            let event_loop = tokio::spawn(
                EventLoop::new(
                    &config,
                    session,
                    table,
                    measures.clone(),
                    transport,
                    socket,
                    dispatcher,
                    feed,
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = event_loop         => tracing::error!("event loop exited: {:?}", r),
            }
        }
        DriverMode::Workers => {
            let receive_task = tokio::spawn(
                ReceiveWorker::new(
                    socket,
                    dispatcher,
                    config.network.recv_buffer,
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            let offer_task = tokio::spawn(
                OfferWorker::new(
                    session.clone(),
                    config.stream.pushes_per_tick,
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            let gossip_task = tokio::spawn(
                GossipWorker::new(
                    session.clone(),
                    table,
                    transport,
                    Duration::from_millis(config.topology.hello_interval_ms.max(1)),
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            let _source_task = feed.map(|feed| {
                tokio::spawn(
                    SourceWorker::new(
                        session.clone(),
                        feed,
                        config.stream.initial_period(),
                        shutdown_tx.subscribe(),
                    )
                    .run(),
                )
            });

            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = receive_task       => tracing::error!("receive worker exited: {:?}", r),
                r = offer_task         => tracing::error!("offer worker exited: {:?}", r),
                r = gossip_task        => tracing::error!("gossip worker exited: {:?}", r),
            }
        }
    }

    measures.log_summary();
    Ok(())
}
