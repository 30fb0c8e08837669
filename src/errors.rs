use std::time::Duration;

use thiserror::Error;

/// Error type returned by pool operations.
///
/// `E` is the error type of the [`Manager`](crate::Manager) implementation.
/// Manager failures during validation are handled internally and never
/// surface here; creation failures do, once all retries are exhausted.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// The pool has been closed and no longer hands out objects.
    #[error("the pool has been closed")]
    Closed,

    /// `Manager::create` failed on every attempt.
    ///
    /// The pool tries `1 + create_retry_count` times before giving up;
    /// `error` is the error of the last attempt.
    #[error("object creation failed after {attempts} attempt(s)")]
    CreateFailed {
        /// Number of creation attempts made.
        attempts: u32,
        /// The error returned by the final attempt.
        error: E,
    },

    /// No idle object became available within the configured poll timeout.
    #[error("no idle object became available within {0:?}")]
    PollTimeout(Duration),

    /// The returned object does not belong to this pool.
    #[error("object does not belong to this pool")]
    NotInPool,

    /// The returned object is not currently borrowed.
    #[error("object is not currently borrowed")]
    DoubleReturn,

    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    Config(String),
}
