//! Common Error Types
//!
//! Provides unified error handling across all modules. Protocol violations
//! are values, never panics: a verifier that catches the server lying gets
//! a `ProofMismatch` carrying the evidence description, and search misses
//! come back as structured `LabelNotFound` / `LabelExpired` outcomes.

use thiserror::Error;

use crate::algorithms::AlgorithmError;
use crate::crypto::signature::SignatureError;
use crate::crypto::vrf::VrfError;
use crate::log_tree::LogTreeError;
use crate::prefix_tree::PrefixTreeError;
use crate::storage::StorageError;
use crate::wire::WireError;

/// Root error type for the log server and its verifiers
#[derive(Debug, Error)]
pub enum KtError {
    /// Malformed or out-of-range input from a caller
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The label has no version matching the request
    #[error("label not found")]
    LabelNotFound,

    /// Every version of the label fell outside the maximum lifetime
    #[error("label expired")]
    LabelExpired,

    /// A proof failed verification; non-retryable, keep the bundle
    #[error("proof mismatch: {0}")]
    ProofMismatch(String),

    /// Server-side data that contradicts itself
    #[error("storage is corrupt: {0}")]
    Corruption(String),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire encoding errors
    #[error("encoding error: {0}")]
    Wire(#[from] WireError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KtError {
    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, KtError::Storage(_) | KtError::Io(_))
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            KtError::BadRequest(_) => "BAD_REQUEST",
            KtError::LabelNotFound => "LABEL_NOT_FOUND",
            KtError::LabelExpired => "LABEL_EXPIRED",
            KtError::ProofMismatch(_) => "PROOF_MISMATCH",
            KtError::Corruption(_) => "CORRUPTION",
            KtError::Storage(_) => "STORAGE_ERROR",
            KtError::Wire(_) => "ENCODING_ERROR",
            KtError::Config(_) => "CONFIG_ERROR",
            KtError::Logging(_) => "LOGGING_ERROR",
            KtError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<AlgorithmError> for KtError {
    fn from(e: AlgorithmError) -> Self {
        match e {
            AlgorithmError::LabelNotFound => KtError::LabelNotFound,
            AlgorithmError::LabelExpired => KtError::LabelExpired,
            AlgorithmError::ProofViolation(m) => KtError::ProofMismatch(m),
            AlgorithmError::BadRequest(m) => KtError::BadRequest(m),
            AlgorithmError::Corruption(m) => KtError::Corruption(m),
            AlgorithmError::Storage(s) => KtError::Storage(s),
        }
    }
}

impl From<LogTreeError> for KtError {
    fn from(e: LogTreeError) -> Self {
        match e {
            LogTreeError::MalformedProof(m) => KtError::ProofMismatch(m),
            LogTreeError::Corruption(m) => KtError::Corruption(m),
            LogTreeError::Storage(s) => KtError::Storage(s),
        }
    }
}

impl From<PrefixTreeError> for KtError {
    fn from(e: PrefixTreeError) -> Self {
        match e {
            PrefixTreeError::InvalidMutation(m) => KtError::BadRequest(m),
            PrefixTreeError::MalformedProof(m) => KtError::ProofMismatch(m),
            PrefixTreeError::Corruption(m) => KtError::Corruption(m),
            PrefixTreeError::Storage(s) => KtError::Storage(s),
        }
    }
}

impl From<SignatureError> for KtError {
    fn from(e: SignatureError) -> Self {
        KtError::ProofMismatch(e.to_string())
    }
}

impl From<VrfError> for KtError {
    fn from(e: VrfError) -> Self {
        KtError::ProofMismatch(e.to_string())
    }
}

/// Result type alias using KtError
pub type Result<T> = std::result::Result<T, KtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(KtError::LabelNotFound.error_code(), "LABEL_NOT_FOUND");
        assert_eq!(
            KtError::BadRequest("x".into()).error_code(),
            "BAD_REQUEST"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(KtError::Storage(StorageError::Connection("down".into())).is_retryable());
        assert!(!KtError::ProofMismatch("bad".into()).is_retryable());
        assert!(!KtError::LabelNotFound.is_retryable());
    }
}
