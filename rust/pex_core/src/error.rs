//! Error types for the permission engine.

use thiserror::Error;

/// Errors surfaced by mutation, loading and configuration paths.
///
/// Resolution itself never fails: an unresolved permission is a value
/// (`0`, undefined), not an error.
#[derive(Debug, Error)]
pub enum PexError {
    /// Optimistic update lost the compare-and-swap race too many times.
    #[error("update of {subject} gave up after {attempts} conflicting attempts")]
    ConflictExhausted { subject: String, attempts: u32 },

    /// A context pair or context set failed validation.
    #[error("malformed context set: {0}")]
    MalformedContextSet(String),

    /// A permission node failed validation.
    #[error("malformed permission node: {0}")]
    MalformedPermissionNode(String),

    /// A subject identity string could not be parsed.
    #[error("malformed subject identity: {0}")]
    MalformedSubjectIdentity(String),

    /// Two segments of one subject share the same context set.
    #[error("duplicate segment for context set {0}")]
    DuplicateContextSet(String),

    /// Backing store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Update through a subject reference the registry already evicted.
    #[error("subject {0} was evicted; fetch a fresh reference")]
    Evicted(String),

    /// The task delivering an update's completion went away.
    #[error("update notification dropped")]
    NotificationDropped,
}

impl PexError {
    /// Whether the failed operation left in-memory data untouched.
    pub fn is_rejected_before_swap(&self) -> bool {
        matches!(
            self,
            Self::ConflictExhausted { .. }
                | Self::MalformedContextSet(_)
                | Self::MalformedPermissionNode(_)
                | Self::MalformedSubjectIdentity(_)
                | Self::Evicted(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PexError>;
