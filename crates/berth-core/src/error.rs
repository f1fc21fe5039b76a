use thiserror::Error;

/// How the dispatcher should react to an executor error.
///
/// Executors return an [`Error`] whose [`class`](Error::class) the dispatcher
/// inspects — never the message text — to choose retry vs mark-failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, database, or provider hiccup. Retried up to `max_attempts`.
    Transient,
    /// Well-formed but non-recoverable. The entity is marked errored and the
    /// job fails without further attempts.
    Fatal,
    /// A concurrent actor got there first (duplicate default, stale version).
    Conflict,
    /// The entity is gone. Idempotent removals treat this as success.
    NotFound,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// Non-recoverable condition with a user-facing message, e.g.
    /// "no default agent is configured".
    #[error("{0}")]
    Fatal(String),

    #[error("transient: {0}")]
    Transient(String),

    /// `git am` could not apply the agent's patches cleanly.
    #[error("patch conflict: {0}")]
    PatchConflict(String),

    /// The sidecar rejected the patch base. Handled internally by
    /// re-prompting with the new parent; never surfaced to callers.
    #[error("parent mismatch: {0}")]
    ParentMismatch(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Classification consumed by the dispatcher's retry logic.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::Conflict(_) | Error::ParentMismatch(_) => ErrorClass::Conflict,
            Error::Unauthorized
            | Error::Forbidden
            | Error::Fatal(_)
            | Error::PatchConflict(_) => ErrorClass::Fatal,
            Error::Transient(_)
            | Error::Git(_)
            | Error::Sandbox(_)
            | Error::Sidecar(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorClass::Transient,
        }
    }

    /// True when retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, Error>;
