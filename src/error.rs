//! Error taxonomy for the connection engine
//!
//! Request-level failures (`FsError`, `StoreError`, `AuthError`) are mapped
//! to status strings by the dispatcher and keep the connection open.
//! `ProtocolError` and `TransferError` leave the framing state unknown and
//! end up as a `ConnectionError`, which closes the connection.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Framing failures. The connection cannot continue after one of these.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("stream closed mid-frame")]
    Truncated,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("idle timeout after {0} ms")]
    TimedOut(u64),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Map a read error, treating an early EOF as truncation
    pub(crate) fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// Failure while streaming file bytes
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("short transfer: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("declared length {declared} exceeds limit {limit}")]
    TooLarge { declared: u64, limit: u64 },

    #[error("file changed during send: announced {announced} bytes, sent {sent}")]
    LengthMismatch { announced: u64, sent: u64 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("file i/o on {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// FileStore failures
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0:?}")]
    NotFound(PathBuf),

    #[error("already exists: {0:?}")]
    AlreadyExists(PathBuf),

    #[error("path {path:?} rejected: {reason}")]
    PathEscape { path: String, reason: String },

    #[error("i/o on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub(crate) fn escape(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FsError::PathEscape {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_escape(&self) -> bool {
        matches!(self, FsError::PathEscape { .. })
    }
}

/// Account store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("account store i/o on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("account store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Password hashing failures
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("stored password digest is unreadable: {0}")]
    BadDigest(String),
}

/// Anything that forces the connection to close
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
