//! Configuration system for meshcast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshcast/config.toml
//!   3. ~/.config/meshcast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshcastConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub rate_control: RateControlConfig,
    pub protocol: ProtocolConfig,
    pub topology: TopologyConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    /// Independent tasks for reception, offering and gossip.
    Workers,
    /// One task that waits for the next timer or datagram.
    EventLoop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind. Empty = all interfaces.
    pub bind: String,
    /// UDP port for every message kind.
    pub port: u16,
    /// Static neighbours, "host:port".
    pub peers: Vec<String>,
    pub driver: DriverMode,
    /// Largest datagram accepted.
    pub recv_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Chunk buffer capacity, in chunks.
    pub buffer_size: u32,
    /// Playout reorder window, in chunks.
    pub playout_window: u32,
    /// Production rate of the source. Also sets the initial offer period.
    pub chunks_per_second: u32,
    /// Max chunks delivered per accepted offer.
    pub chunks_per_offer: u32,
    /// Neighbours offered to per tick.
    pub offers_per_tick: u32,
    /// Unsolicited chunk pushes per tick, on top of offers.
    pub pushes_per_tick: u32,
    /// Peers a new chunk is pushed to by the source.
    pub source_multiplicity: u32,
    /// Chunks older than this are never requested or sent. 0 = unlimited.
    pub retention_ms: u64,
    /// Chunks within this much of the oldest held one are not offered.
    pub offer_horizon_ms: u64,
    /// Output filter. Negative = open bound.
    pub start_id: i64,
    pub end_id: i64,
    /// false = write every chunk straight through on arrival.
    pub reorder: bool,
    /// Drop every chunk whose id is a multiple of this. 0 = off.
    pub chunk_loss_interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControlConfig {
    pub autotune: bool,
    /// EWMA weight kept on each accept outcome.
    pub smoothing: f64,
    pub min_accept_ratio: f64,
    pub max_ack_latency_ms: u64,
    /// Relative period change per second.
    pub rate_up: f64,
    pub rate_down: f64,
    pub period_min_us: u64,
    pub period_max_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub lock_lease_ms: u64,
    pub transaction_lifetime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub hello_interval_ms: u64,
    /// Dynamic neighbours silent for longer than this are dropped.
    pub neighbour_ttl_ms: u64,
    /// Add senders of unsolicited hellos to the neighbour set.
    pub register_unknown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    /// Unframed bytes, chunked at a fixed size.
    Raw,
    /// 4-byte big-endian length + encoded chunk, repeated.
    Chunkstream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Input path. None = this peer relays only.
    pub input: Option<PathBuf>,
    pub format: StreamFormat,
    /// Payload bytes per chunk for raw input.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output path. None = stdout.
    pub path: Option<PathBuf>,
    pub format: StreamFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between measure summaries. 0 = never.
    pub summary_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: String::new(),
            port: 6666,
            peers: Vec::new(),
            driver: DriverMode::Workers,
            recv_buffer: 65_536,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            playout_window: 75,
            chunks_per_second: 25,
            chunks_per_offer: 1,
            offers_per_tick: 1,
            pushes_per_tick: 0,
            source_multiplicity: 3,
            retention_ms: 0,
            offer_horizon_ms: 500,
            start_id: -1,
            end_id: -1,
            reorder: true,
            chunk_loss_interval: 0,
        }
    }
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            autotune: true,
            smoothing: 0.9,
            min_accept_ratio: 0.3,
            max_ack_latency_ms: 300,
            rate_up: 0.2,
            rate_down: 0.1,
            period_min_us: 5_000,
            period_max_us: 1_000_000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            lock_lease_ms: 2_000,
            transaction_lifetime_ms: 10_000,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            hello_interval_ms: 1_000,
            neighbour_ttl_ms: 10_000,
            register_unknown: true,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: None,
            format: StreamFormat::Raw,
            chunk_size: 1_316,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: StreamFormat::Raw,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            summary_interval_secs: 10,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl StreamConfig {
    /// Offer period before rate control adapts it: one chunk interval.
    pub fn initial_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.chunks_per_second.max(1)))
    }

    pub fn offer_horizon(&self) -> Duration {
        Duration::from_millis(self.offer_horizon_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_ms > 0).then(|| Duration::from_millis(self.retention_ms))
    }

    /// Inclusive output filter, `None` on an open side.
    pub fn output_range(&self) -> (Option<u32>, Option<u32>) {
        let bound = |v: i64| u32::try_from(v).ok();
        (bound(self.start_id), bound(self.end_id))
    }
}

impl ProtocolConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn transaction_lifetime(&self) -> Duration {
        Duration::from_millis(self.transaction_lifetime_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("meshcast")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshcastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            MeshcastConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshcastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// True when this peer produces the stream.
    pub fn is_source(&self) -> bool {
        self.source.input.is_some()
    }

    /// Apply MESHCAST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MESHCAST_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Some(v) = var("MESHCAST_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = var("MESHCAST_NETWORK__PEERS") {
            self.network.peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("MESHCAST_NETWORK__DRIVER") {
            match v.as_str() {
                "workers" => self.network.driver = DriverMode::Workers,
                "event_loop" => self.network.driver = DriverMode::EventLoop,
                _ => {}
            }
        }
        if let Some(v) = var("MESHCAST_SOURCE__INPUT") {
            self.source.input = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("MESHCAST_OUTPUT__PATH") {
            self.output.path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("MESHCAST_RATE_CONTROL__AUTOTUNE") {
            self.rate_control.autotune = v == "true" || v == "1";
        }
        if let Some(v) = var("MESHCAST_STREAM__CHUNK_LOSS_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.stream.chunk_loss_interval = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let config = MeshcastConfig::default();
        assert_eq!(config.network.port, 6666);
        assert_eq!(config.stream.buffer_size, 50);
        assert_eq!(config.stream.playout_window, 75);
        assert_eq!(config.protocol.lock_lease(), Duration::from_secs(2));
        assert_eq!(config.protocol.transaction_lifetime(), Duration::from_secs(10));
        assert_eq!(config.stream.initial_period(), Duration::from_millis(40));
        assert_eq!(config.stream.output_range(), (None, None));
        assert!(config.stream.retention().is_none());
        assert!(!config.is_source());
    }

    #[test]
    fn overrides_replace_peers_and_input() {
        let mut config = MeshcastConfig::default();
        config.apply_overrides(|key| match key {
            "MESHCAST_NETWORK__PEERS" => Some("10.0.0.1:6666, 10.0.0.2:6666,".into()),
            "MESHCAST_NETWORK__PORT" => Some("7000".into()),
            "MESHCAST_NETWORK__DRIVER" => Some("event_loop".into()),
            "MESHCAST_SOURCE__INPUT" => Some("/tmp/in.ts".into()),
            "MESHCAST_RATE_CONTROL__AUTOTUNE" => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.network.peers, vec!["10.0.0.1:6666", "10.0.0.2:6666"]);
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.driver, DriverMode::EventLoop);
        assert!(config.is_source());
        assert!(!config.rate_control.autotune);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let text = r#"
            [stream]
            buffer_size = 80
            start_id = 100

            [network]
            driver = "event_loop"
        "#;
        let config: MeshcastConfig = toml::from_str(text).unwrap();
        assert_eq!(config.stream.buffer_size, 80);
        assert_eq!(config.stream.playout_window, 75);
        assert_eq!(config.stream.output_range(), (Some(100), None));
        assert_eq!(config.network.driver, DriverMode::EventLoop);
        assert_eq!(config.network.port, 6666);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("meshcast-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("MESHCAST_CONFIG", config_path.to_str().unwrap());
        }

        let path = MeshcastConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeshcastConfig::load_from(&path).expect("load should succeed");
        assert_eq!(config.stream.buffer_size, 50);

        unsafe {
            std::env::remove_var("MESHCAST_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
