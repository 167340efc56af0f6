//! Playout — turns the unordered chunk arrivals into an ordered output.
//!
//! A fixed window of slots indexed by `id % window` holds chunks that
//! arrived ahead of `next_expected`. The expected chunk is written at once
//! and pulls any contiguous successors out of the window. A chunk too far
//! ahead slides the window first: everything it pushes out is written if
//! present and counted as lost otherwise.

use std::io;
use std::sync::{Arc, Mutex};

use meshcast_core::Chunk;

use crate::lock;
use crate::telemetry::Telemetry;

/// Output stage fed by the playout buffer.
pub trait ChunkSink: Send {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()>;
}

/// Collects written chunks in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<u32> {
        lock(&self.chunks).iter().map(|c| c.id).collect()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        lock(&self.chunks).clone()
    }
}

impl ChunkSink for MemorySink {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        lock(&self.chunks).push(chunk.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutOutcome {
    /// Written immediately (possibly with successors).
    Played,
    /// Held in the window until its predecessors arrive.
    Stored,
    /// Older than `next_expected`.
    Stale,
    Duplicate,
    /// Its slot held a different id. The slot was reset.
    Collision,
}

pub struct PlayoutBuffer {
    slots: Box<[Option<Chunk>]>,
    /// Next id due for output. Set by the first chunk seen.
    next_expected: Option<u64>,
    reorder: bool,
    start_id: Option<u32>,
    end_id: Option<u32>,
    sink: Box<dyn ChunkSink>,
    last_played: Option<u32>,
    end_reported: bool,
}

impl PlayoutBuffer {
    /// `reorder == false` writes every arrival straight through; the window
    /// then only keeps loss and duplicate bookkeeping.
    pub fn new(
        window: usize,
        reorder: bool,
        output_range: (Option<u32>, Option<u32>),
        sink: Box<dyn ChunkSink>,
    ) -> Self {
        let window = window.max(1);
        Self {
            slots: (0..window).map(|_| None).collect(),
            next_expected: None,
            reorder,
            start_id: output_range.0,
            end_id: output_range.1,
            sink,
            last_played: None,
            end_reported: false,
        }
    }

    pub fn window(&self) -> usize {
        self.slots.len()
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    /// Chunks waiting in the window.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn push(&mut self, chunk: Chunk, telemetry: &dyn Telemetry) -> PlayoutOutcome {
        if !self.reorder {
            self.write(&chunk);
        }

        let id = u64::from(chunk.id);
        let next = match self.next_expected {
            Some(next) if id < next => return PlayoutOutcome::Stale,
            Some(next) => next,
            None => {
                tracing::info!(chunk = chunk.id, "first chunk received");
                self.next_expected = Some(id);
                id
            }
        };

        let n = self.slots.len() as u64;
        if id >= next + n {
            self.slide(next, id - n, chunk.timestamp_us, telemetry);
            self.flush(telemetry);
        }

        if Some(id) == self.next_expected {
            self.emit(chunk, telemetry);
            self.flush(telemetry);
            return PlayoutOutcome::Played;
        }

        let slot = (id % n) as usize;
        match &self.slots[slot] {
            Some(held) if held.id == chunk.id => {
                tracing::trace!(chunk = chunk.id, "duplicate in playout window");
                telemetry.chunk_duplicate(chunk.id);
                PlayoutOutcome::Duplicate
            }
            Some(held) => {
                tracing::error!(
                    chunk = chunk.id,
                    held = held.id,
                    slot,
                    next_expected = self.next_expected,
                    "playout slot holds a foreign chunk, resetting slot"
                );
                self.slots[slot] = Some(chunk);
                PlayoutOutcome::Collision
            }
            None => {
                self.slots[slot] = Some(chunk);
                PlayoutOutcome::Stored
            }
        }
    }

    /// Push every id in `[next, last]` out of the window.
    /// Window slots are flushed one by one; ids past the window are
    /// reported as a single gap.
    fn slide(&mut self, next: u64, last: u64, timestamp_us: u64, telemetry: &dyn Telemetry) {
        let n = self.slots.len() as u64;
        let window_last = last.min(next + n - 1);
        for i in next..=window_last {
            match self.slots[(i % n) as usize].take() {
                Some(held) => self.emit(held, telemetry),
                None => telemetry.playout(i as u32, timestamp_us, false),
            }
            self.next_expected = Some(i + 1);
        }
        // Beyond the window nothing can be held.
        if last > window_last {
            telemetry.playout_gap((window_last + 1) as u32, last - window_last);
        }
        self.next_expected = Some(last + 1);
        tracing::debug!(next_expected = last + 1, "playout window slid");
    }

    /// Emit contiguous held chunks starting at `next_expected`.
    fn flush(&mut self, telemetry: &dyn Telemetry) {
        let n = self.slots.len() as u64;
        for _ in 0..n {
            let Some(next) = self.next_expected else {
                return;
            };
            let slot = (next % n) as usize;
            let Some(held) = self.slots[slot].take() else {
                return;
            };
            if u64::from(held.id) != next {
                tracing::error!(held = held.id, next_expected = next, "stale chunk in playout slot, dropped");
                return;
            }
            self.emit(held, telemetry);
        }
    }

    fn emit(&mut self, chunk: Chunk, telemetry: &dyn Telemetry) {
        let after_start = self.start_id.map_or(true, |s| chunk.id >= s);
        let before_end = self.end_id.map_or(true, |e| chunk.id <= e);
        if after_start && before_end {
            if self.last_played.is_none() {
                tracing::info!(chunk = chunk.id, "first chunk played out");
            }
            if self.reorder {
                self.write(&chunk);
            }
            self.last_played = Some(chunk.id);
        } else if after_start && !self.end_reported {
            if let Some(last) = self.last_played {
                tracing::info!(chunk = last, "last chunk played out");
                self.end_reported = true;
            }
        }
        telemetry.playout(chunk.id, chunk.timestamp_us, true);
        self.next_expected = Some(u64::from(chunk.id) + 1);
    }

    fn write(&mut self, chunk: &Chunk) {
        if let Err(e) = self.sink.write_chunk(chunk) {
            tracing::warn!(chunk = chunk.id, error = %e, "output write failed");
        }
    }
}
