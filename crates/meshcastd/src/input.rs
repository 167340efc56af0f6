//! Stream input for the source role.
//!
//! `RawSource` cuts an unframed byte stream into fixed-size payloads;
//! `ChunkStreamSource` replays chunks recorded by a `ChunkStreamWriter`.
//! Either is read on a blocking thread by `spawn_reader`, so the drivers
//! only ever poll a channel.

use std::fs::File;
use std::io::{self, BufReader, Read};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};

use meshcast_core::config::{SourceConfig, StreamFormat};
use meshcast_core::wire;
use meshcast_services::{ChunkSource, SourceItem};

use crate::net::MAX_DATAGRAM;

/// Items read ahead of production.
pub const READ_AHEAD: usize = 64;

pub struct RawSource<R> {
    reader: R,
    chunk_size: usize,
}

impl<R: Read + Send> RawSource<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<R: Read + Send> ChunkSource for RawSource<R> {
    fn next_item(&mut self) -> io::Result<Option<SourceItem>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(SourceItem::Payload(Bytes::from(buf))))
    }
}

/// Reads `u32` big-endian length + encoded chunk records.
pub struct ChunkStreamSource<R> {
    reader: R,
}

impl<R: Read + Send> ChunkStreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> ChunkSource for ChunkStreamSource<R> {
    fn next_item(&mut self) -> io::Result<Option<SourceItem>> {
        let mut len = [0u8; 4];
        match self.reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_DATAGRAM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk record of {len} bytes exceeds {MAX_DATAGRAM}"),
            ));
        }
        let mut record = vec![0u8; len];
        self.reader.read_exact(&mut record)?;
        let (chunk, _) = wire::decode_chunk(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(SourceItem::Chunk(chunk)))
    }
}

// ── Read-ahead ───────────────────────────────────────────────────────────────

/// What the producer finds when it polls the feed.
#[derive(Debug)]
pub enum Feed {
    Item(SourceItem),
    /// The reader has nothing ready yet.
    Pending,
    Done,
    Failed(io::Error),
}

/// Receiving end of a reader started by `spawn_reader`.
pub struct SourceFeed {
    rx: mpsc::Receiver<io::Result<SourceItem>>,
}

impl SourceFeed {
    /// Never waits on the input.
    pub fn poll_item(&mut self) -> Feed {
        match self.rx.try_recv() {
            Ok(Ok(item)) => Feed::Item(item),
            Ok(Err(e)) => Feed::Failed(e),
            Err(TryRecvError::Empty) => Feed::Pending,
            Err(TryRecvError::Disconnected) => Feed::Done,
        }
    }
}

/// Move `source` onto a blocking thread that reads up to `depth` items ahead.
///
/// Must be called from within a tokio runtime. The reader stops at end of
/// input, after the first read error, or once the feed is dropped.
pub fn spawn_reader(mut source: Box<dyn ChunkSource>, depth: usize) -> SourceFeed {
    let (tx, rx) = mpsc::channel(depth.max(1));
    tokio::task::spawn_blocking(move || loop {
        let item = match source.next_item() {
            Ok(Some(item)) => Ok(item),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.blocking_send(item).is_err() || failed {
            break;
        }
    });
    SourceFeed { rx }
}

/// Open the configured input. `None` when this peer has no input.
pub fn open_source(config: &SourceConfig) -> Result<Option<Box<dyn ChunkSource>>> {
    let Some(path) = &config.input else {
        return Ok(None);
    };
    let file = File::open(path).with_context(|| format!("failed to open input {}", path.display()))?;
    let reader = BufReader::new(file);
    tracing::info!(path = %path.display(), format = ?config.format, "stream input opened");
    let source: Box<dyn ChunkSource> = match config.format {
        StreamFormat::Raw => Box::new(RawSource::new(reader, config.chunk_size)),
        StreamFormat::Chunkstream => Box::new(ChunkStreamSource::new(reader)),
    };
    Ok(Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use meshcast_core::Chunk;
    use meshcast_services::ChunkSink;

    use crate::output::ChunkStreamWriter;

    fn payload_len(item: Option<SourceItem>) -> Option<usize> {
        match item? {
            SourceItem::Payload(p) => Some(p.len()),
            SourceItem::Chunk(_) => panic!("raw input yields payloads"),
        }
    }

    #[test]
    fn raw_input_is_cut_at_chunk_size() {
        let mut source = RawSource::new(Cursor::new(vec![7u8; 10]), 4);
        assert_eq!(payload_len(source.next_item().unwrap()), Some(4));
        assert_eq!(payload_len(source.next_item().unwrap()), Some(4));
        assert_eq!(payload_len(source.next_item().unwrap()), Some(2));
        assert_eq!(payload_len(source.next_item().unwrap()), None);
    }

    #[test]
    fn recorded_chunks_replay_with_their_ids() {
        let mut writer = ChunkStreamWriter::new(Vec::new());
        for id in [4u32, 5, 9] {
            let chunk = Chunk::new(id, 1_000 + u64::from(id), Bytes::from(vec![id as u8; 3]));
            writer.write_chunk(&chunk).unwrap();
        }

        let mut source = ChunkStreamSource::new(Cursor::new(writer.into_inner()));
        let mut ids = Vec::new();
        while let Some(item) = source.next_item().unwrap() {
            match item {
                SourceItem::Chunk(c) => {
                    assert_eq!(c.timestamp_us, 1_000 + u64::from(c.id));
                    ids.push(c.id);
                }
                SourceItem::Payload(_) => panic!("chunk stream yields chunks"),
            }
        }
        assert_eq!(ids, vec![4, 5, 9]);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut bytes = 100u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0x11, 0, 0]);
        let mut source = ChunkStreamSource::new(Cursor::new(bytes));
        assert!(source.next_item().is_err());
    }

    #[test]
    fn oversized_record_length_is_rejected() {
        // No payload follows: the length alone must be refused.
        let mut source = ChunkStreamSource::new(Cursor::new(u32::MAX.to_be_bytes().to_vec()));
        let err = source.next_item().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bytes = ((MAX_DATAGRAM + 1) as u32).to_be_bytes().to_vec();
        bytes.resize(4 + MAX_DATAGRAM + 1, 0);
        let mut source = ChunkStreamSource::new(Cursor::new(bytes));
        assert_eq!(source.next_item().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    async fn drain(feed: &mut SourceFeed) -> (Vec<usize>, Feed) {
        let mut lens = Vec::new();
        loop {
            match feed.poll_item() {
                Feed::Item(SourceItem::Payload(p)) => lens.push(p.len()),
                Feed::Item(SourceItem::Chunk(_)) => panic!("raw input yields payloads"),
                Feed::Pending => tokio::time::sleep(std::time::Duration::from_millis(1)).await,
                end => return (lens, end),
            }
        }
    }

    #[tokio::test]
    async fn reader_feeds_items_in_order_then_ends() {
        let source = RawSource::new(Cursor::new(vec![1u8; 10]), 4);
        let mut feed = spawn_reader(Box::new(source), 1);

        let (lens, end) = tokio::time::timeout(std::time::Duration::from_secs(5), drain(&mut feed))
            .await
            .expect("reader stalled");
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(matches!(end, Feed::Done));
    }

    #[tokio::test]
    async fn reader_error_reaches_the_feed() {
        let mut bytes = 100u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0x11, 0, 0]);
        let mut feed = spawn_reader(Box::new(ChunkStreamSource::new(Cursor::new(bytes))), 4);

        let (lens, end) = tokio::time::timeout(std::time::Duration::from_secs(5), drain(&mut feed))
            .await
            .expect("reader stalled");
        assert!(lens.is_empty());
        assert!(matches!(end, Feed::Failed(_)));
        let (rest, end) = drain(&mut feed).await;
        assert!(rest.is_empty());
        assert!(matches!(end, Feed::Done));
    }
}
