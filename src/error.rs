//! Error types for the fingerprinting engine

use std::fmt;

/// Errors that can occur while building or querying a fingerprint index
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Invalid input parameters
    InvalidInput(String),

    /// External decoder exited nonzero or produced a malformed stream
    DecoderFailed(String),

    /// Analysis parameters disagree between index and query
    BadParams(String),

    /// Index artifact is missing or malformed
    IndexUnreadable(String),

    /// Index artifact ends in a partial tail
    IndexTruncated(String),

    /// A fingerprinting worker terminated abnormally
    WorkerLost(String),

    /// Persisting the index artifact failed; the previous artifact is intact
    WriteFailed(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            EngineError::DecoderFailed(msg) => write!(f, "Decoder failed: {}", msg),
            EngineError::BadParams(msg) => write!(f, "Parameter mismatch: {}", msg),
            EngineError::IndexUnreadable(msg) => write!(f, "Index unreadable: {}", msg),
            EngineError::IndexTruncated(msg) => write!(f, "Index truncated: {}", msg),
            EngineError::WorkerLost(msg) => write!(f, "Worker lost: {}", msg),
            EngineError::WriteFailed(msg) => write!(f, "Write failed: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}
