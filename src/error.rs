use std::io;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage and recovery core.
///
/// Pool exhaustion is the only recoverable condition; the caller is expected
/// to retry or abort the enclosing transaction. Everything else is fatal to
/// the operation that produced it and must not be swallowed, since the
/// recovery protocol depends on every step completing before the next one.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Every buffer in the pool is pinned. Never retried internally.
    #[error("no unpinned buffer available")]
    PoolExhausted,

    /// A log write was requested against a buffer with no block loaded.
    #[error("buffer is not bound to any block")]
    UnboundBuffer,

    /// A record pulled off the log could not be decoded. The log is written
    /// only by this crate, so this indicates corruption and aborts recovery.
    #[error("malformed log record: {reason}")]
    MalformedLogRecord { reason: String },

    #[error("log record encoding failed: {source}")]
    Codec {
        #[from]
        source: bincode::Error,
    },
}
