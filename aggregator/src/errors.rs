use thiserror::Error;

/// Result type alias for aggregator operations
pub type Result<T, E = AggregatorError> = std::result::Result<T, E>;

/// Errors that can occur during aggregation
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Programmer bug inside the core (e.g. double set_expected); logged
    /// and tolerated, counters stay valid.
    #[error("invalid aggregation state: {0}")]
    InvalidState(String),

    #[error("resource request failed for {0}: {1}")]
    ResourceRequestFailed(String, String),

    #[error("failed to serialize request: {0}")]
    RequestSerializationError(#[from] serde_json::Error),

    #[error("stream already subscribed for correlation {0}")]
    StreamConflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the signaling-session endpoints. Unlike the
/// aggregation path these fail loudly toward the client.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignalingError {
    #[error("unknown or expired session")]
    NotFound,

    #[error("invalid session token")]
    Unauthorized,

    #[error("session already has the maximum number of subscribers")]
    SubscriberLimit,
}
