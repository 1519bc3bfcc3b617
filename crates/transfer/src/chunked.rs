use std::sync::Arc;

use crate::digest::DigestEngine;
use crate::store::ObjectStore;
use crate::{DEFAULT_TRANSFER_CHUNK_SIZE, TransferError};

/// A piece of an artifact read at a known offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the artifact.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads an artifact from an [`ObjectStore`] in fixed-size chunks.
///
/// The cursor only moves on [`advance`](Self::advance), so a chunk whose
/// downstream write failed can be read again from the same offset.
pub struct ChunkReader {
    store: Arc<dyn ObjectStore>,
    location: String,
    chunk_size: usize,
    offset: u64,
    total_size: u64,
}

impl ChunkReader {
    /// Opens `location` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_TRANSFER_CHUNK_SIZE`] is used.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        location: &str,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let total_size = store
            .size(location)?
            .ok_or_else(|| TransferError::NotFound(location.to_string()))?;
        let chunk_size = if chunk_size == 0 {
            DEFAULT_TRANSFER_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            store,
            location: location.to_string(),
            chunk_size,
            offset: 0,
            total_size,
        })
    }

    /// Moves the cursor to `offset` (for resume).
    pub fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset > self.total_size {
            return Err(TransferError::InvalidRequest(format!(
                "offset {offset} beyond end of {} ({} bytes)",
                self.location, self.total_size
            )));
        }
        self.offset = offset;
        Ok(())
    }

    /// Reads the chunk at the cursor without moving it. Returns `None` at
    /// the end of the artifact.
    pub fn peek_chunk(&self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64) as usize;
        let data = self.store.read_at(&self.location, self.offset, read_size)?;
        if data.len() != read_size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} shrank while reading: wanted {read_size} bytes at {}, got {}",
                    self.location,
                    self.offset,
                    data.len()
                ),
            )));
        }
        Ok(Some(Chunk {
            offset: self.offset,
            data,
        }))
    }

    /// Moves the cursor forward after a chunk has been consumed.
    pub fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes as u64).min(self.total_size);
    }

    /// Reads the next chunk and moves past it.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let chunk = self.peek_chunk()?;
        if let Some(c) = &chunk {
            self.advance(c.len());
        }
        Ok(chunk)
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total artifact size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Streams the first `len` bytes of an artifact through a fresh
/// [`DigestEngine`]. Pass `None` to hash the whole artifact.
pub fn calculate_checksum(
    store: Arc<dyn ObjectStore>,
    location: &str,
    len: Option<u64>,
    chunk_size: usize,
) -> Result<DigestEngine, TransferError> {
    let mut reader = ChunkReader::new(store, location, chunk_size)?;
    let limit = len.unwrap_or(reader.total_size());
    if limit > reader.total_size() {
        return Err(TransferError::InvalidRequest(format!(
            "{location} holds {} bytes, cannot hash {limit}",
            reader.total_size()
        )));
    }

    let mut engine = DigestEngine::new();
    while let Some(chunk) = reader.next_chunk()? {
        let wanted = (limit - chunk.offset).min(chunk.len() as u64) as usize;
        engine.update(&chunk.data[..wanted]);
        if engine.bytes_hashed() >= limit {
            break;
        }
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::checksum_bytes;
    use crate::store::LocalStore;
    use tempfile::TempDir;

    fn store_with(data: &[u8]) -> (TempDir, Arc<dyn ObjectStore>) {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        store.write_at("src.bin", 0, data).unwrap();
        (tmp, Arc::new(store))
    }

    #[test]
    fn reads_in_chunks() {
        let data = b"Hello, World! This is a test file for chunked reading.";
        let (_tmp, store) = store_with(data);

        let mut reader = ChunkReader::new(store, "src.bin", 10).unwrap();
        assert_eq!(reader.total_size(), data.len() as u64);

        let mut reassembled = Vec::new();
        let mut count = 0;
        while let Some(chunk) = reader.next_chunk().unwrap() {
            assert_eq!(chunk.offset, reassembled.len() as u64);
            reassembled.extend_from_slice(&chunk.data);
            count += 1;
        }
        assert_eq!(reassembled, data);
        assert_eq!(count, 6);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn peek_does_not_advance() {
        let (_tmp, store) = store_with(b"0123456789");
        let mut reader = ChunkReader::new(store, "src.bin", 4).unwrap();

        let first = reader.peek_chunk().unwrap().unwrap();
        let again = reader.peek_chunk().unwrap().unwrap();
        assert_eq!(first, again);

        reader.advance(first.len());
        assert_eq!(reader.next_chunk().unwrap().unwrap().data, b"4567");
        assert_eq!(reader.next_chunk().unwrap().unwrap().data, b"89");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn seek_resumes_mid_artifact() {
        let (_tmp, store) = store_with(b"0123456789ABCDEF");
        let mut reader = ChunkReader::new(store, "src.bin", 4).unwrap();
        reader.seek_to(8).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap().data, b"89AB");
        assert!(reader.seek_to(17).is_err());
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let (_tmp, store) = store_with(b"x");
        assert!(matches!(
            ChunkReader::new(store, "nope", 4),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let (_tmp, store) = store_with(b"x");
        let reader = ChunkReader::new(store, "src.bin", 0).unwrap();
        assert_eq!(reader.chunk_size(), DEFAULT_TRANSFER_CHUNK_SIZE);
    }

    #[test]
    fn checksum_of_whole_artifact() {
        let data = vec![7u8; 1000];
        let (_tmp, store) = store_with(&data);
        let engine = calculate_checksum(store, "src.bin", None, 64).unwrap();
        assert_eq!(engine.bytes_hashed(), 1000);
        assert_eq!(engine.finalize_hex(), checksum_bytes(&data));
    }

    #[test]
    fn checksum_of_prefix() {
        let data: Vec<u8> = (0..100u8).collect();
        let (_tmp, store) = store_with(&data);
        let engine = calculate_checksum(store.clone(), "src.bin", Some(37), 10).unwrap();
        assert_eq!(engine.bytes_hashed(), 37);
        assert_eq!(engine.finalize_hex(), checksum_bytes(&data[..37]));

        assert!(calculate_checksum(store, "src.bin", Some(101), 10).is_err());
    }
}
