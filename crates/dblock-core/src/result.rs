//! Outcome of the non-blocking `synchronize` variants

use crate::error::{LockError, Result};

/// Whether the lock was acquired, and if so what the task returned
///
/// `Failure` carries no value at all, so "lock not acquired" stays distinct
/// from "lock acquired, task returned `None`" (`Success(None)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum SynchronizeResult<T> {
    /// The lock was acquired and the task ran to completion
    Success(T),
    /// The lock was not acquired; the task did not run
    Failure,
}

impl<T> SynchronizeResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// The task's return value, if the lock was acquired
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure => None,
        }
    }

    /// The task's return value, or an error if the lock was not acquired
    pub fn into_value(self) -> Result<T> {
        self.success().ok_or_else(|| {
            LockError::InvalidArgument(
                "Lock was not acquired, no return value available.".to_string(),
            )
        })
    }

    pub fn as_ref(&self) -> SynchronizeResult<&T> {
        match self {
            Self::Success(value) => SynchronizeResult::Success(value),
            Self::Failure => SynchronizeResult::Failure,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SynchronizeResult<U> {
        match self {
            Self::Success(value) => SynchronizeResult::Success(f(value)),
            Self::Failure => SynchronizeResult::Failure,
        }
    }
}

impl<T> From<SynchronizeResult<T>> for Option<T> {
    fn from(result: SynchronizeResult<T>) -> Self {
        result.success()
    }
}
