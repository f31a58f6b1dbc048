use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot assign {groups} stream groups: no live instances")]
    Unassignable { groups: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("assignment violates invariant: {0}")]
    InvariantViolation(String),

    #[error("throughput info unavailable for {cluster}: {reason}")]
    ThroughputUnavailable { cluster: String, reason: String },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("leadership lost")]
    LeadershipLost,

    #[error("lease {0:x} expired")]
    LeaseExpired(i64),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Errors that abort a single rebalance attempt but leave the engine
    /// running. They need a change in inputs or configuration before a retry
    /// can succeed.
    pub fn is_assignment_failure(&self) -> bool {
        matches!(
            self,
            Self::Unassignable { .. } | Self::InvalidConfiguration(_) | Self::InvariantViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
