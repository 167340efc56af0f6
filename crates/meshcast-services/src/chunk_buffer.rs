//! Chunk buffer — the chunks this peer currently holds and can offer.
//!
//! Ordered by id and bounded in count. When full, adding a newer chunk
//! evicts the earliest one; a chunk older than everything held in a full
//! buffer is refused as old.

use std::collections::BTreeMap;

use meshcast_core::{BufferMap, Chunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Older than the whole window of a full buffer.
    Old,
    Duplicate,
}

#[derive(Debug)]
pub struct ChunkBuffer {
    capacity: usize,
    chunks: BTreeMap<u32, Chunk>,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chunks: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn add(&mut self, chunk: Chunk) -> AddOutcome {
        if self.chunks.contains_key(&chunk.id) {
            return AddOutcome::Duplicate;
        }
        if self.chunks.len() >= self.capacity {
            if let Some((&earliest, _)) = self.chunks.first_key_value() {
                if chunk.id < earliest {
                    return AddOutcome::Old;
                }
            }
        }
        self.chunks.insert(chunk.id, chunk);
        while self.chunks.len() > self.capacity {
            self.chunks.pop_first();
        }
        AddOutcome::Added
    }

    pub fn get(&self, id: u32) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Chunk> {
        self.chunks.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.chunks.contains_key(&id)
    }

    /// All held chunks, ascending by id.
    pub fn chunks(&self) -> impl DoubleEndedIterator<Item = &Chunk> + ExactSizeIterator {
        self.chunks.values()
    }

    pub fn timestamp_of(&self, id: u32) -> Option<u64> {
        self.chunks.get(&id).map(|c| c.timestamp_us)
    }

    pub fn latest_id(&self) -> Option<u32> {
        self.chunks.last_key_value().map(|(&id, _)| id)
    }

    pub fn buffer_map(&self) -> BufferMap {
        self.chunks.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(id: u32) -> Chunk {
        Chunk::new(id, u64::from(id) * 1_000, Bytes::new())
    }

    #[test]
    fn evicts_earliest_when_full() {
        let mut buf = ChunkBuffer::new(3);
        for id in [1, 2, 3, 4] {
            assert_eq!(buf.add(chunk(id)), AddOutcome::Added);
        }
        assert_eq!(buf.len(), 3);
        assert!(!buf.contains(1));
        assert_eq!(buf.buffer_map().iter().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buf.latest_id(), Some(4));
    }

    #[test]
    fn refuses_duplicates_and_old_chunks() {
        let mut buf = ChunkBuffer::new(2);
        buf.add(chunk(10));
        buf.add(chunk(11));
        assert_eq!(buf.add(chunk(11)), AddOutcome::Duplicate);
        assert_eq!(buf.add(chunk(5)), AddOutcome::Old);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn late_chunk_fits_while_not_full() {
        let mut buf = ChunkBuffer::new(4);
        buf.add(chunk(10));
        assert_eq!(buf.add(chunk(5)), AddOutcome::Added);
        assert_eq!(buf.chunks().map(|c| c.id).collect::<Vec<_>>(), vec![5, 10]);
        assert_eq!(buf.timestamp_of(5), Some(5_000));
    }
}
