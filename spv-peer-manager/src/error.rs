//! Error types for the SPV peer manager.

use thiserror::Error;

/// Main error type for the SPV peer manager.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),
}

/// Bloom filter construction errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BloomError {
    #[error("Invalid element count: {0}")]
    InvalidElementCount(u32),

    #[error("Invalid false positive rate: {0}")]
    InvalidFalsePositiveRate(f64),

    #[error("Filter too large: {0} bytes")]
    FilterTooLarge(usize),

    #[error("Too many hash functions: {0}")]
    TooManyHashFuncs(u32),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),
}

/// Network-related errors.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Not connected")]
    NotConnected,
}

/// Validation-related errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid proof of work")]
    InvalidProofOfWork,

    #[error("Invalid header chain: {0}")]
    InvalidHeaderChain(String),

    #[error("Invalid merkle proof: {0}")]
    InvalidMerkleProof(String),

    #[error("Checkpoint mismatch at height {height}")]
    CheckpointMismatch {
        height: u32,
    },

    #[error("Block timestamp {time} is too far in the future")]
    TimestampTooFarInFuture {
        time: u32,
    },

    #[error("Reorganization of depth {depth} exceeds limit {max_depth}")]
    ReorgTooDeep {
        depth: u32,
        max_depth: u32,
    },

    #[error("Invalid seed data: {0}")]
    InvalidSeed(String),
}

/// Synchronization-related errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Indicates an invalid state in the manager lifecycle (e.g., registering callbacks twice)
    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    /// Timeout errors during sync operations (e.g., download peer stalled)
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Network-related errors (e.g., no reachable peers)
    #[error("Network error: {0}")]
    Network(String),

    /// Validation errors for data received during sync
    #[error("Validation error: {0}")]
    Validation(String),
}

impl SyncError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::InvalidState(_) => "state",
            SyncError::Timeout(_) => "timeout",
            SyncError::Network(_) => "network",
            SyncError::Validation(_) => "validation",
        }
    }
}

/// Failure outcomes of a published transaction, delivered through its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("Transaction is not signed")]
    InvalidTransaction,

    #[error("No connected peers")]
    NotConnected,

    #[error("Transaction rejected by all peers")]
    Rejected {
        rescan_recommended: bool,
    },

    #[error("No peer relayed the transaction before the deadline")]
    TimedOut,

    #[error("Publish cancelled")]
    Cancelled,
}

/// POSIX-style error code reported with `SyncFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncErrorCode {
    /// The manager was disconnected while a sync was in progress.
    Cancelled,
    /// The download peer stalled and no replacement was available.
    TimedOut,
    /// No peer could be reached.
    NotConnected,
    /// The network reachability check reported no connectivity.
    NetworkUnreachable,
    /// A peer violated the protocol and could not be replaced.
    Protocol,
}

impl SyncErrorCode {
    /// Linux errno value for this code.
    pub fn as_errno(self) -> i32 {
        match self {
            SyncErrorCode::Cancelled => 125,
            SyncErrorCode::TimedOut => 110,
            SyncErrorCode::NotConnected => 107,
            SyncErrorCode::NetworkUnreachable => 101,
            SyncErrorCode::Protocol => 71,
        }
    }
}

impl std::fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncErrorCode::Cancelled => "ECANCELED",
            SyncErrorCode::TimedOut => "ETIMEDOUT",
            SyncErrorCode::NotConnected => "ENOTCONN",
            SyncErrorCode::NetworkUnreachable => "ENETUNREACH",
            SyncErrorCode::Protocol => "EPROTO",
        };
        write!(f, "{} ({})", name, self.as_errno())
    }
}

/// Type alias for Result with SpvError.
pub type Result<T> = std::result::Result<T, SpvError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for validation operation results.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

/// Type alias for bloom filter results.
pub type BloomResult<T> = std::result::Result<T, BloomError>;

impl From<NetworkError> for SyncError {
    fn from(err: NetworkError) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_category() {
        assert_eq!(SyncError::InvalidState("x".into()).category(), "state");
        assert_eq!(SyncError::Timeout("x".into()).category(), "timeout");
        assert_eq!(SyncError::Network("x".into()).category(), "network");
        assert_eq!(SyncError::Validation("x".into()).category(), "validation");
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(SyncErrorCode::Cancelled.as_errno(), 125);
        assert_eq!(SyncErrorCode::TimedOut.as_errno(), 110);
        assert_eq!(SyncErrorCode::NotConnected.as_errno(), 107);
        assert_eq!(SyncErrorCode::NetworkUnreachable.as_errno(), 101);
        assert_eq!(SyncErrorCode::Protocol.as_errno(), 71);
        assert_eq!(SyncErrorCode::Cancelled.to_string(), "ECANCELED (125)");
    }

    #[test]
    fn test_conversions_into_sync_error() {
        let err: SyncError = ValidationError::InvalidProofOfWork.into();
        assert_eq!(err.category(), "validation");

        let err: SyncError = NetworkError::Timeout.into();
        assert_eq!(err.category(), "network");

        let spv: SpvError = SyncError::InvalidState("twice".into()).into();
        assert!(spv.to_string().contains("twice"));
    }
}
