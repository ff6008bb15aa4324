//! Chunked sprite transfer assembly
//!
//! A render response announces the total size, the chunk size the server
//! cut the payload into, the number of chunks and the SHA-256 of the
//! sprite. Chunks may then arrive in any order; each one lands at
//! `index * chunk_size`. Every chunk but the last is exactly `chunk_size`
//! bytes, the last one holds the remainder.

use log::debug;
use sha2::{Digest, Sha256};

use crate::app::ContentHash;
use crate::error::TransferError;

/// An in-progress chunked download, owned by its app
#[derive(Debug)]
pub struct Transfer {
    buffer: Vec<u8>,
    chunk_count: u32,
    chunk_size: usize,
    seen: Vec<bool>,
    chunks_received: u32,
    next_expected: u32,
    expected_hash: ContentHash,
}

impl Transfer {
    pub fn new(
        total_size: usize,
        chunk_count: u32,
        chunk_size: usize,
        expected_hash: ContentHash,
    ) -> Result<Self, TransferError> {
        if total_size == 0 || chunk_size == 0 || total_size.div_ceil(chunk_size) != chunk_count as usize {
            return Err(TransferError::InvalidHeader {
                total_size,
                chunk_count,
                chunk_size,
            });
        }

        Ok(Self {
            buffer: vec![0; total_size],
            chunk_count,
            chunk_size,
            seen: vec![false; chunk_count as usize],
            chunks_received: 0,
            next_expected: 0,
            expected_hash,
        })
    }

    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    /// Lowest chunk index not yet received
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Copy a chunk into place. Returns whether the transfer is now complete.
    ///
    /// Duplicate chunks are ignored. A short chunk is refused without
    /// being recorded, so a resend of the same index can still land.
    pub fn add_chunk(&mut self, index: u32, data: &[u8]) -> Result<bool, TransferError> {
        if index >= self.chunk_count {
            return Err(TransferError::ChunkIndexOutOfRange {
                index,
                count: self.chunk_count,
            });
        }
        if self.seen[index as usize] {
            debug!("Duplicate chunk {} ignored", index);
            return Ok(self.is_complete());
        }

        let offset = index as usize * self.chunk_size;
        let expected = self.chunk_size.min(self.buffer.len() - offset);
        if data.len() > expected {
            return Err(TransferError::ChunkOverflow { index });
        }
        if data.len() < expected {
            return Err(TransferError::ShortChunk {
                index,
                len: data.len(),
                expected,
            });
        }
        if index != self.next_expected {
            debug!("Chunk {} arrived out of order (expected {})", index, self.next_expected);
        }

        self.buffer[offset..offset + expected].copy_from_slice(data);
        self.seen[index as usize] = true;
        self.chunks_received += 1;
        while (self.next_expected as usize) < self.seen.len() && self.seen[self.next_expected as usize] {
            self.next_expected += 1;
        }

        Ok(self.is_complete())
    }

    /// Every declared chunk arrived. Chunk lengths are checked on entry,
    /// so together they cover the declared size exactly.
    pub fn is_complete(&self) -> bool {
        self.chunks_received == self.chunk_count
    }

    /// Verify the assembled bytes against the announced hash and hand them over
    pub fn finalize(self) -> Result<Vec<u8>, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::Incomplete);
        }
        if content_hash(&self.buffer) != self.expected_hash {
            return Err(TransferError::HashMismatch);
        }
        Ok(self.buffer)
    }
}

/// SHA-256 of sprite bytes
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    Sha256::digest(bytes).into()
}
