//! Error types for qr-attendance-core

use std::time::Duration;

use thiserror::Error;

/// Main error type for the qr-attendance-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote store could not be reached while connecting
    #[error("connection error: {0}")]
    Connection(String),

    /// A remote operation failed outside the delivery loop
    #[error("remote error: {0}")]
    Remote(#[from] DeliveryError),

    /// The delivery worker could not be started or joined
    #[error("worker error: {0}")]
    Worker(String),
}

/// Result type alias for qr-attendance-core
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single remote operation failed.
///
/// The delivery worker treats every variant the same way (the record goes to
/// the fallback file), but the kind is kept for logging and for callers that
/// want to react differently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No usable connection to the remote store
    #[error("not connected to remote store")]
    NotConnected,

    /// Network or transport failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// The operation did not finish within the allowed time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store answered with a non-success status
    #[error("rejected by remote store ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl DeliveryError {
    /// Short, stable label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::NotConnected => "not_connected",
            DeliveryError::Connection(_) => "connection",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Rejected { .. } => "rejected",
        }
    }
}

/// A fallback line that could not be turned back into a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineParseError {
    #[error("missing tab separator")]
    MissingSeparator,

    #[error("unrecognized timestamp {0:?}")]
    Timestamp(String),
}
