//! Error types for dblock
//!
//! After an acquire, release or wait error, the state of the affected lock(s)
//! is undefined. Callers must not infer whether a lock is held from the error
//! alone. To recover, attempt an explicit release, tolerate it failing, and
//! only then retry.

use std::fmt;
use thiserror::Error;

/// Boxed error used as the cause of a lock error
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias using [`LockError`]
pub type Result<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be acquired due to an error.
    ///
    /// Never raised when the lock is simply held by another connection: that
    /// case is reported as `false` by the `try_*` operations.
    #[error("{message}")]
    Acquire {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The lock could not be released due to an error.
    #[error("{message}")]
    Release {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Waiting for the lock failed while acquiring or releasing it.
    #[error("Cannot wait for lock")]
    Wait {
        #[source]
        source: Box<LockError>,
    },

    /// Caller error, reported before any backend interaction.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl LockError {
    /// Acquire error for a single named lock
    pub fn acquire(lock_name: &str, description: impl fmt::Display) -> Self {
        Self::Acquire {
            message: format!("Cannot acquire lock with name \"{}\": {}", lock_name, description),
            source: None,
        }
    }

    /// Acquire error for a single named lock, caused by another error
    ///
    /// The cause is only reachable through `source()`.
    pub fn acquire_caused(
        lock_name: &str,
        description: impl fmt::Display,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::Acquire {
            message: format!("Cannot acquire lock with name \"{}\": {}", lock_name, description),
            source: Some(cause.into()),
        }
    }

    /// Acquire error for a multi lock, caused by another error
    pub fn multi_acquire(description: impl fmt::Display, cause: impl Into<BoxError>) -> Self {
        Self::Acquire {
            message: format!("Cannot acquire multi lock: {}", description),
            source: Some(cause.into()),
        }
    }

    /// Release error for a single named lock
    pub fn release(lock_name: &str, description: impl fmt::Display) -> Self {
        Self::Release {
            message: format!("Cannot release lock with name \"{}\": {}", lock_name, description),
            source: None,
        }
    }

    /// Release error for a single named lock, caused by another error
    pub fn release_caused(
        lock_name: &str,
        description: impl fmt::Display,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::Release {
            message: format!("Cannot release lock with name \"{}\": {}", lock_name, description),
            source: Some(cause.into()),
        }
    }

    /// Wrap an acquire or release error raised while waiting
    pub fn wait(inner: LockError) -> Self {
        Self::Wait {
            source: Box::new(inner),
        }
    }

    /// Get the kind of this error
    pub fn kind(&self) -> LockErrorKind {
        match self {
            Self::Acquire { .. } => LockErrorKind::Acquire,
            Self::Release { .. } => LockErrorKind::Release,
            Self::Wait { .. } => LockErrorKind::Wait,
            Self::InvalidArgument(_) => LockErrorKind::InvalidArgument,
        }
    }

    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Acquire { .. } => "E300",
            Self::Release { .. } => "E301",
            Self::Wait { .. } => "E302",
            Self::InvalidArgument(_) => "E303",
        }
    }

    /// Whether the held/not-held state of the lock is unknown after this error
    pub fn is_state_undefined(&self) -> bool {
        self.kind().is_state_undefined()
    }
}

/// Kind of a [`LockError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockErrorKind {
    Acquire,
    Release,
    Wait,
    InvalidArgument,
}

impl LockErrorKind {
    /// Short name used when reporting the error to another process
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "LockAcquireError",
            Self::Release => "LockReleaseError",
            Self::Wait => "LockWaitError",
            Self::InvalidArgument => "InvalidArgument",
        }
    }

    pub fn is_state_undefined(&self) -> bool {
        !matches!(self, Self::InvalidArgument)
    }
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure of a `synchronize` family call
///
/// `E` is the error type of the task.
#[derive(Error, Debug)]
pub enum SynchronizeError<E> {
    /// Acquiring the lock failed (the task did not run), or releasing it
    /// failed after the task succeeded.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The task failed; the lock was released.
    #[error(transparent)]
    Task(E),

    /// The task failed and the release that followed failed too.
    ///
    /// The release error is what gets reported; the task error is attached
    /// as its source.
    #[error("{release} (after the task failed)")]
    ReleaseAfterTask {
        release: LockError,
        #[source]
        task: E,
    },
}

impl<E> SynchronizeError<E> {
    /// The lock error, if the lock misbehaved
    pub fn lock_error(&self) -> Option<&LockError> {
        match self {
            Self::Lock(e) => Some(e),
            Self::ReleaseAfterTask { release, .. } => Some(release),
            Self::Task(_) => None,
        }
    }

    /// The task error, if the task ran and failed
    pub fn task_error(&self) -> Option<&E> {
        match self {
            Self::Task(e) | Self::ReleaseAfterTask { task: e, .. } => Some(e),
            Self::Lock(_) => None,
        }
    }

    /// Consume the error, keeping only the task error
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task(e) | Self::ReleaseAfterTask { task: e, .. } => Some(e),
            Self::Lock(_) => None,
        }
    }

    /// Whether the lock was acquired before the failure
    ///
    /// False only when acquisition itself failed; in that case the task did
    /// not run.
    pub fn lock_was_acquired(&self) -> bool {
        !matches!(self, Self::Lock(LockError::Acquire { .. } | LockError::InvalidArgument(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_acquire_error_message() {
        let err = LockError::acquire("foo", "GET_LOCK() returned NULL");
        assert_eq!(
            err.to_string(),
            "Cannot acquire lock with name \"foo\": GET_LOCK() returned NULL"
        );
        assert!(err.source().is_none());
        assert_eq!(err.kind(), LockErrorKind::Acquire);
        assert_eq!(err.code(), "E300");
    }

    #[test]
    fn test_caused_errors_keep_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection lost");
        let err = LockError::release_caused("foo", "Error while calling RELEASE_LOCK()", io_err);

        assert_eq!(
            err.to_string(),
            "Cannot release lock with name \"foo\": Error while calling RELEASE_LOCK()"
        );
        assert_eq!(err.source().map(|s| s.to_string()), Some("connection lost".to_string()));
        assert_eq!(err.kind(), LockErrorKind::Release);
    }

    #[test]
    fn test_chain_names_each_cause_once() {
        let io_err = std::io::Error::other("connection lost");
        let err = LockError::wait(LockError::acquire_caused(
            "foo",
            "Error while calling GET_LOCK()",
            io_err,
        ));

        let chain = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(
            chain,
            "Cannot wait for lock: Cannot acquire lock with name \"foo\": Error while calling GET_LOCK(): connection lost"
        );
        assert_eq!(chain.matches("connection lost").count(), 1);
    }

    #[test]
    fn test_multi_acquire_message() {
        let inner = LockError::release("id:1", "The lock does not exist.");
        let err = LockError::multi_acquire("Error while rolling back", inner);

        assert_eq!(err.to_string(), "Cannot acquire multi lock: Error while rolling back");
        assert!(err.source().is_some_and(|s| s.to_string().contains("id:1")));
        assert_eq!(err.kind(), LockErrorKind::Acquire);
    }

    #[test]
    fn test_wait_wraps_inner_error() {
        let err = LockError::wait(LockError::acquire("foo", "boom"));

        assert_eq!(err.to_string(), "Cannot wait for lock");
        assert_eq!(err.kind(), LockErrorKind::Wait);
        assert_eq!(err.code(), "E302");

        let source = err.source().expect("wait error should have a source");
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn test_state_undefined_flags() {
        assert!(LockError::acquire("a", "x").is_state_undefined());
        assert!(LockError::release("a", "x").is_state_undefined());
        assert!(LockError::wait(LockError::release("a", "x")).is_state_undefined());
        assert!(!LockError::InvalidArgument("x".to_string()).is_state_undefined());
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(LockErrorKind::Acquire.to_string(), "LockAcquireError");
        assert_eq!(LockErrorKind::Release.to_string(), "LockReleaseError");
        assert_eq!(LockErrorKind::Wait.to_string(), "LockWaitError");
        assert_eq!(LockErrorKind::InvalidArgument.to_string(), "InvalidArgument");
    }

    #[test]
    fn test_synchronize_error_release_after_task() {
        let task_err = std::io::Error::other("task exploded");
        let err = SynchronizeError::ReleaseAfterTask {
            release: LockError::release("foo", "The lock was not acquired."),
            task: task_err,
        };

        assert_eq!(
            err.to_string(),
            "Cannot release lock with name \"foo\": The lock was not acquired. (after the task failed)"
        );
        assert_eq!(err.source().map(|s| s.to_string()), Some("task exploded".to_string()));
        assert!(err.lock_error().is_some());
        assert!(err.lock_was_acquired());
        assert_eq!(
            err.into_task_error().map(|e| e.to_string()),
            Some("task exploded".to_string())
        );
    }

    #[test]
    fn test_synchronize_error_from_acquire() {
        let err: SynchronizeError<std::io::Error> = LockError::acquire("foo", "boom").into();

        assert!(!err.lock_was_acquired());
        assert!(err.task_error().is_none());
        assert_eq!(err.to_string(), "Cannot acquire lock with name \"foo\": boom");
    }
}
