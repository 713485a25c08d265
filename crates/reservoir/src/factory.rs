//! Object factory traits
//!
//! A pool drives the full lifecycle of its objects through a factory:
//! create, activate on borrow, passivate on return, validate, destroy.
//! Only `create` is required; the remaining hooks default to no-ops.

use std::future::Future;

use crate::object::DestroyMode;

/// Factory for a single-keyspace [`Pool`](crate::pool::Pool).
///
/// Hooks are invoked by the task that triggered them, never with pool locks
/// held, so they may block or take their time without wedging the pool.
pub trait Factory: Send + Sync + 'static {
    /// The pooled object type.
    type Object: Send + 'static;

    /// Error produced by fallible hooks.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new object. Called once capacity has been acquired and no
    /// idle object is available; on failure the capacity is released before
    /// the error is surfaced.
    fn create(&self) -> impl Future<Output = Result<Self::Object, Self::Error>> + Send;

    /// Prepare an idle object for handoff to a borrower. Failure destroys
    /// the object and the borrow retries.
    fn activate(
        &self,
        _object: &mut Self::Object,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Quiesce an object on return, before it re-enters the idle store.
    /// Failure destroys the object.
    fn passivate(
        &self,
        _object: &mut Self::Object,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Check whether an object is still usable. Consulted on borrow, return,
    /// idle tests and creation depending on configuration; `false` destroys
    /// the object.
    fn validate(&self, _object: &mut Self::Object) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Tear an object down. Terminal; called at most once per object.
    /// Failures must be handled internally; the pool's accounting proceeds
    /// regardless of what destruction does.
    fn destroy(
        &self,
        object: Self::Object,
        _mode: DestroyMode,
    ) -> impl Future<Output = ()> + Send {
        async {
            drop(object);
        }
    }
}

/// Factory for a [`KeyedPool`](crate::keyed::KeyedPool).
///
/// Identical contract to [`Factory`], with the sub-pool key passed to every
/// hook so one factory can serve a family of independent populations.
pub trait KeyedFactory<K>: Send + Sync + 'static
where
    K: Send + Sync,
{
    /// The pooled object type.
    type Object: Send + 'static;

    /// Error produced by fallible hooks.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new object for `key`.
    fn create(&self, key: &K) -> impl Future<Output = Result<Self::Object, Self::Error>> + Send;

    /// Prepare an idle object for handoff to a borrower.
    fn activate(
        &self,
        _key: &K,
        _object: &mut Self::Object,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Quiesce an object on return.
    fn passivate(
        &self,
        _key: &K,
        _object: &mut Self::Object,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Check whether an object is still usable.
    fn validate(&self, _key: &K, _object: &mut Self::Object) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Tear an object down. Terminal; called at most once per object.
    fn destroy(
        &self,
        _key: &K,
        object: Self::Object,
        _mode: DestroyMode,
    ) -> impl Future<Output = ()> + Send {
        async {
            drop(object);
        }
    }
}
