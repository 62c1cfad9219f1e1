//! Error types for reconciliation.
//!
//! The variants follow how the scheduler must react: conflicts are re-read
//! and recomputed, not-ready conditions stall the state machine, not-found
//! ends the current cycle, and everything else backs off and is surfaced on
//! the cluster's event stream.

use pgwarden_core::SerialError;

/// The result type used throughout pgwarden-operator.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Volume identity metadata could not be parsed; aborts the adoption pass.
    #[error("malformed identity: {0}")]
    MalformedIdentity(#[from] SerialError),

    /// Optimistic concurrency check failed: the object changed since it was read.
    #[error("conflict writing {kind} '{name}': object was modified")]
    Conflict { kind: &'static str, name: String },

    /// The object no longer exists. Terminal for the current cycle.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// A health or replication check did not succeed in time.
    #[error("instance '{instance}' not ready: {reason}")]
    NotReady { instance: String, reason: String },

    /// Talking to an instance manager failed.
    #[error("instance '{instance}' request failed: {message}")]
    Instance { instance: String, message: String },

    /// Object store connectivity or permission failure.
    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn not_ready(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotReady {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the scheduler should try again. Not-found is terminal.
    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }

    /// Short label for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedIdentity(_) => "malformed_identity",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::NotReady { .. } => "not_ready",
            Self::Instance { .. } => "instance",
            Self::Store { .. } => "store",
        }
    }
}
