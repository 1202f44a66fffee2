//! Error types for the volume lifecycle engine.

use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An identifier string failed to decode.
    #[error("Bad identifier: {0}")]
    BadIdentifier(String),

    /// A journal entry or backend resource is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A reservation collided with an existing object owned by a different
    /// request name. Needs operator attention.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The key is currently locked by another in-flight operation. The
    /// caller retries at its own cadence.
    #[error("Operation pending: {0}")]
    Aborted(String),

    /// A compare-and-swap on a versioned object observed a concurrent
    /// modification. The caller retries with a fresh version.
    #[error("Object out of date: {0}")]
    ObjectOutOfDate(String),

    /// The journal's reverse pointer disagrees with the forward pointer.
    /// Never auto-repaired; an operator must intervene.
    #[error("Internal state inconsistent: {0}")]
    StateInconsistent(String),

    /// Ceph I/O timed out or connectivity was lost. The caller retries.
    #[error("Transient backend failure: {0}")]
    BackendTransient(String),

    /// The backend rejected the request outright.
    #[error("Backend failure: {0}")]
    BackendPermanent(String),

    /// A secret is missing or malformed.
    #[error("Invalid credentials: {0}")]
    CredentialInvalid(String),

    /// The request deadline elapsed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A required request parameter is missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a retry of the whole operation may succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Aborted(_)
                | EngineError::ObjectOutOfDate(_)
                | EngineError::BackendTransient(_)
        )
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
