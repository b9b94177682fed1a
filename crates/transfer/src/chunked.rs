use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::DEFAULT_CHUNK_SIZE;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A contiguous byte range of a payload, sent as one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the payload.
    pub offset: u64,
    /// Chunk data; a cheap slice of the payload.
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the first byte after this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Splits an in-memory payload into fixed-size chunks.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    payload: Bytes,
    chunk_size: usize,
    offset: u64,
}

impl ChunkReader {
    /// Creates a reader positioned at the start of `payload`.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(payload: Bytes, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            payload,
            chunk_size,
            offset: 0,
        }
    }

    /// Moves to the given byte offset (for resume). Offsets past the end
    /// clamp to the payload length.
    pub fn seek_to(&mut self, offset: u64) {
        self.offset = offset.min(self.file_size());
    }

    /// Returns the next chunk, or `None` at the end of the payload.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        let remaining = self.remaining();
        if remaining == 0 {
            return None;
        }
        let start = self.offset as usize;
        let len = remaining.min(self.chunk_size as u64) as usize;
        let chunk = Chunk {
            offset: self.offset,
            data: self.payload.slice(start..start + len),
        };
        self.offset += len as u64;
        Some(chunk)
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total payload size in bytes.
    pub fn file_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size() - self.offset
    }

    /// Number of chunks left from the current offset.
    pub fn chunks_remaining(&self) -> u64 {
        self.remaining().div_ceil(self.chunk_size as u64)
    }
}
