//! Error types for the firmware core
//!
//! Nothing here is fatal: every error is reported to the caller, logged,
//! and handled by degrading the affected operation.

use thiserror::Error;

/// App catalog errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Catalog is at capacity
    #[error("app catalog is full")]
    CatalogFull,
    /// No app with that UUID
    #[error("app not found")]
    NotFound,
    /// Bounded lock acquisition failed
    #[error("registry lock timed out")]
    LockTimeout,
}

/// Chunked transfer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("app not found")]
    UnknownApp,
    #[error("no transfer in progress")]
    NoTransfer,
    #[error("invalid transfer header: {total_size} bytes in {chunk_count} chunks of {chunk_size}")]
    InvalidHeader {
        total_size: usize,
        chunk_count: u32,
        chunk_size: usize,
    },
    /// Declared size exceeds what the device accepts
    #[error("transfer of {total_size} bytes exceeds the {max} byte limit")]
    TooLarge { total_size: usize, max: usize },
    #[error("chunk {index} out of range ({count} chunks declared)")]
    ChunkIndexOutOfRange { index: u32, count: u32 },
    /// Chunk would write past the declared total size
    #[error("chunk {index} overflows the declared size")]
    ChunkOverflow { index: u32 },
    /// Chunk shorter than its slot; the slot stays open for a resend
    #[error("chunk {index} has {len} bytes, expected {expected}")]
    ShortChunk { index: u32, len: usize, expected: usize },
    #[error("transfer incomplete")]
    Incomplete,
    /// Assembled bytes do not match the announced content hash
    #[error("content hash mismatch")]
    HashMismatch,
    #[error("transfer lock timed out")]
    LockTimeout,
}

/// Sprite validation and decode errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpriteError {
    #[error("sprite too short ({0} bytes)")]
    TooShort(usize),
    /// RIFF/WEBP signature missing
    #[error("bad container magic")]
    BadMagic,
    #[error("sprite decode failed")]
    Decode,
    #[error("sprite dimensions {width}x{height} out of bounds")]
    TooLarge { width: u32, height: u32 },
    #[error("no sprite data")]
    Empty,
    /// App lock not acquired in time
    #[error("sprite busy")]
    Unavailable,
}

/// Inbound message parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("JSON parse error")]
    Json,
    #[error("invalid UUID")]
    InvalidUuid,
}

/// Configuration persistence errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config storage write failed")]
    Storage,
    #[error("config encode failed")]
    Encode,
    #[error("config decode failed")]
    Decode,
}
