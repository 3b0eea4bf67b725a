use thiserror::Error;

/// Unified error type for the storage, graph, sync and broker layers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage fault: {0}")]
    Storage(String),

    #[error("transport fault calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("missing user id header")]
    MissingUserId,

    #[error("invariant breach: {0}")]
    InvariantBreach(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    pub fn transport(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// True for the class of errors the engine loops log and retry on the next
    /// tick rather than propagate.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }
}
