//! Playout output — where ordered chunks end up.
//!
//! The session writes into a `ChannelSink`; a blocking writer thread started
//! by `spawn_writer` owns the real sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use meshcast_core::config::{OutputConfig, StreamFormat};
use meshcast_core::{wire, Chunk};
use meshcast_services::ChunkSink;

/// Writes payload bytes only, reconstructing the original stream.
pub struct RawWriter<W> {
    out: W,
}

impl<W: Write + Send> RawWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ChunkSink for RawWriter<W> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.out.write_all(&chunk.payload)?;
        self.out.flush()
    }
}

/// Writes `u32` big-endian length + encoded chunk, keeping ids and timestamps.
pub struct ChunkStreamWriter<W> {
    out: W,
}

impl<W: Write + Send> ChunkStreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ChunkSink for ChunkStreamWriter<W> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        let record = wire::encode_chunk(chunk, 0)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.out.write_all(&(record.len() as u32).to_be_bytes())?;
        self.out.write_all(&record)?;
        self.out.flush()
    }
}

// ── Write-behind ─────────────────────────────────────────────────────────────

/// Played chunks queued for the writer thread.
pub const WRITE_BEHIND: usize = 1024;

/// Queues chunks for the writer thread without blocking the caller.
pub struct ChannelSink {
    tx: mpsc::Sender<Chunk>,
}

impl ChunkSink for ChannelSink {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.tx.try_send(chunk.clone()).map_err(|e| match e {
            TrySendError::Full(_) => io::Error::new(io::ErrorKind::WouldBlock, "output writer is behind"),
            TrySendError::Closed(_) => io::Error::new(io::ErrorKind::BrokenPipe, "output writer stopped"),
        })
    }
}

/// Move `sink` onto a blocking thread fed through a queue of `depth` chunks.
///
/// Must be called from within a tokio runtime. The thread exits once every
/// `ChannelSink` is dropped and the queue is drained.
pub fn spawn_writer(mut sink: Box<dyn ChunkSink>, depth: usize) -> (ChannelSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Chunk>(depth.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            if let Err(e) = sink.write_chunk(&chunk) {
                tracing::warn!(chunk = chunk.id, error = %e, "output write failed");
            }
        }
        tracing::debug!("output writer finished");
    });
    (ChannelSink { tx }, handle)
}

/// Open the configured output, stdout when no path is set.
pub fn open_sink(config: &OutputConfig) -> Result<Box<dyn ChunkSink>> {
    let out: Box<dyn Write + Send> = match &config.path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create output {}", path.display()))?;
            tracing::info!(path = %path.display(), format = ?config.format, "playout output opened");
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout()),
    };
    Ok(match config.format {
        StreamFormat::Raw => Box::new(RawWriter::new(out)),
        StreamFormat::Chunkstream => Box::new(ChunkStreamWriter::new(out)),
    })
}
