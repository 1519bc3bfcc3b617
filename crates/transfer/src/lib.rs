//! Chunked transfer primitives: digests, object storage, upload sessions
//! and the content-addressed index.
//!
//! Everything here is synchronous and safe to share between threads. The
//! async engine drives these types from blocking tasks.

mod chunked;
mod digest;
mod index;
mod ledger;
mod progress;
mod store;
mod validation;

use skyvault_protocol::{ErrorDetail, ErrorKind};

pub use chunked::{Chunk, ChunkReader, calculate_checksum};
pub use digest::{DigestEngine, checksum_bytes, normalize_digest};
pub use index::{ContentIndex, ContentObject, RegisterOutcome, object_location};
pub use ledger::{
    ChunkLedger, CompleteOutcome, InitUploadOutcome, SessionInfo, expected_chunk_count,
    owned_session_id, upload_session_id,
};
pub use progress::SpeedCalculator;
pub use store::{LocalStore, ObjectStore};
pub use validation::{validate_file_name, validate_location};

/// Default upload chunk size: 10 MiB.
///
/// Clients split uploads into pieces of exactly this size (the last piece
/// carries the remainder).
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Default read size for server-side transfers: 4 MiB.
pub const DEFAULT_TRANSFER_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate and the engine built on it.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("integrity check failed: expected digest {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("quota exceeded for {principal}: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        principal: String,
        requested: u64,
        available: u64,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl TransferError {
    /// Maps the error onto the client-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Io(_) | TransferError::Json(_) => ErrorKind::Io,
            TransferError::Integrity { .. } => ErrorKind::Integrity,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::InvalidState(_) => ErrorKind::InvalidState,
            TransferError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            TransferError::InvalidPath(_) | TransferError::InvalidRequest(_) => {
                ErrorKind::InvalidRequest
            }
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Interrupted(_) => ErrorKind::Interrupted,
        }
    }

    /// Returns `true` for I/O failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Builds the detail recorded on a failed task.
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_transience() {
        let transient = TransferError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(transient.is_transient());
        assert_eq!(transient.kind(), ErrorKind::Io);

        let permanent =
            TransferError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!permanent.is_transient());
    }

    #[test]
    fn integrity_is_never_transient() {
        let err = TransferError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn detail_carries_message() {
        let err = TransferError::QuotaExceeded {
            principal: "alice".into(),
            requested: 10,
            available: 4,
        };
        let detail = err.detail();
        assert_eq!(detail.kind, ErrorKind::QuotaExceeded);
        assert!(detail.message.contains("alice"));
        assert!(detail.message.contains("4 available"));
    }

    #[test]
    fn path_errors_are_invalid_requests() {
        assert_eq!(
            TransferError::InvalidPath("..".into()).kind(),
            ErrorKind::InvalidRequest
        );
    }
}
