//! Error taxonomy for the server core.
//!
//! `StoreError` covers everything a single command can fail with and still
//! leave the connection usable; each variant maps to one `ERROR` line.
//! `SessionError` means the stream itself is broken and the connection ends.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::reply;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid filename: {name:?}")]
    InvalidName { name: String },

    #[error("file not found: {name}")]
    NotFound { name: String },

    #[error("cannot read shared directory: {0}")]
    ListDir(#[source] io::Error),

    #[error("cannot open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot create temp file for {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("write to temp file for {name} failed: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("rename into place failed for {name}: {source}")]
    Rename {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Wire line reported to the peer for this failure.
    pub fn reply(&self) -> &'static str {
        match self {
            StoreError::InvalidName { .. } => reply::ERR_INVALID_NAME,
            StoreError::NotFound { .. } => reply::ERR_NOT_FOUND,
            StoreError::ListDir(_) => reply::ERR_LIST_DIR,
            StoreError::Open { .. } => reply::ERR_OPEN,
            StoreError::Create { .. } => reply::ERR_CREATE,
            StoreError::Write { .. } => reply::ERR_WRITE,
            StoreError::Rename { .. } => reply::ERR_RENAME,
        }
    }
}

/// A command line that names a known verb but cannot be executed as sent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed UPLOAD header: {raw:?}")]
    UploadHeader { raw: String },
}

impl ProtocolError {
    pub fn reply(&self) -> &'static str {
        match self {
            ProtocolError::UploadHeader { .. } => reply::ERR_UPLOAD_HEADER,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("peer disconnected after {received} of {expected} bytes")]
    ShortUpload { expected: u64, received: u64 },
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
