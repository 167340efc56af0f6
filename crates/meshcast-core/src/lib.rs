//! meshcast-core — shared types, wire format, and configuration.
//! All other meshcast crates depend on this one.

pub mod buffermap;
pub mod chunk;
pub mod config;
pub mod peer_id;
pub mod wire;

pub use buffermap::BufferMap;
pub use chunk::{now_micros, Chunk, ChunkAttributes};
pub use config::MeshcastConfig;
pub use peer_id::PeerId;
