//! UDP plumbing — socket setup, the datagram transport, and inbound dispatch.
//!
//! One socket carries every message kind. The first byte of a datagram
//! picks the handler; see `meshcast_core::wire`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use meshcast_core::config::NetworkConfig;
use meshcast_core::wire::{self, MessageKind};
use meshcast_core::PeerId;
use meshcast_services::{PeerTable, StreamingSession, Transport, TransportError};

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// Create the non-blocking peer socket described by `[network]`.
pub fn make_socket(config: &NetworkConfig) -> Result<Socket> {
    let ip: IpAddr = if config.bind.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", config.bind))?
    };
    let addr = SocketAddr::new(ip, config.port);

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).with_context(|| format!("bind({addr})"))?;

    Ok(socket)
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Sends engine messages as single datagrams.
///
/// Holds a duplicate handle of the peer socket, so replies leave from the
/// port neighbours know us by. Sends never wait: a full socket buffer
/// fails the send.
pub struct UdpTransport {
    socket: Socket,
}

impl UdpTransport {
    pub fn new(socket: Socket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, peer: &PeerId, bytes: &[u8]) -> Result<usize, TransportError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(TransportError::TooLarge(bytes.len()));
        }
        self.socket
            .send_to(bytes, &peer.addr().into())
            .map_err(|source| TransportError::Io { peer: *peer, source })
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Routes one received datagram to the topology table or the engine.
pub struct Dispatcher {
    session: Arc<StreamingSession>,
    table: PeerTable,
    register_unknown: bool,
}

impl Dispatcher {
    pub fn new(session: Arc<StreamingSession>, table: PeerTable, register_unknown: bool) -> Self {
        Self {
            session,
            table,
            register_unknown,
        }
    }

    pub fn handle(&self, from: SocketAddr, bytes: &[u8]) {
        let from = PeerId::from(from);
        let kind = match wire::message_kind(bytes) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "dropping datagram");
                return;
            }
        };

        let now = Instant::now();
        let result = match kind {
            MessageKind::Topology => {
                match wire::decode_hello(bytes) {
                    Ok(hello) => {
                        if self.table.hello(from, hello.capacity, self.register_unknown, now) {
                            tracing::trace!(peer = %from, capacity = hello.capacity, source = hello.source, "hello");
                        }
                    }
                    Err(e) => tracing::warn!(peer = %from, error = %e, "bad hello"),
                }
                return;
            }
            MessageKind::Signaling => {
                self.touch_known(from, now);
                self.session.handle_signaling(&from, bytes)
            }
            MessageKind::Chunk => {
                self.touch_known(from, now);
                self.session.receive_chunk(&from, bytes)
            }
        };
        if let Err(e) = result {
            tracing::warn!(peer = %from, ?kind, error = %e, "message handling failed");
        }
    }

    /// Any traffic from a neighbour counts as liveness.
    fn touch_known(&self, from: PeerId, now: Instant) {
        if self.table.contains(&from) {
            self.table.touch(from, now);
        }
    }
}
