//! Error types for pool operations
use std::time::Duration;

use thiserror::Error;

/// Result type for pool operations, generic over the factory error.
pub type Result<T, E> = std::result::Result<T, Error<E>>;

/// Error type for pool operations.
///
/// `E` is the error type of the [`Factory`](crate::factory::Factory) backing
/// the pool. Factory failures during a user-visible borrow are surfaced as
/// [`Error::Factory`] after the pool has already released the capacity the
/// failed creation held.
#[derive(Error, Debug)]
pub enum Error<E> {
    /// No capacity and the pool is configured not to block.
    #[error("pool exhausted: {active} active of {max_total} max, {waiters} waiting")]
    Exhausted {
        /// Objects currently checked out.
        active: usize,
        /// Configured capacity bound.
        max_total: usize,
        /// Borrowers parked in the waiter queue.
        waiters: usize,
    },

    /// A blocking borrow exceeded its deadline.
    #[error("timed out after {waited:?} waiting for a pooled object")]
    Timeout {
        /// How long the borrow waited before giving up.
        waited: Duration,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,

    /// A factory callback failed.
    #[error("factory error")]
    Factory(#[source] E),

    /// Return or invalidate of an object the pool no longer tracks as
    /// borrowed (double return, or return after an abandonment sweep).
    #[error("illegal object state: {reason}")]
    IllegalState {
        /// What the caller did wrong.
        reason: String,
    },

    /// Invalid configuration at construction.
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message.
        message: String,
    },
}

impl<E> Error<E> {
    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an illegal-state error.
    pub(crate) fn illegal<S: Into<String>>(reason: S) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Timeout { .. })
    }
}
