//! RAII guard for borrowed objects
//!
//! A `Guard` owns the resource while it is checked out. The preferred way to
//! give an object back is [`Pool::put_back`](crate::pool::Pool::put_back),
//! which completes the return inline; a guard dropped without an explicit
//! return performs the same return on a spawned task. The guard holds only a
//! weak reference to the pool, so outstanding guards never keep a dropped
//! pool alive.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::factory::Factory;
use crate::object::PooledObject;
use crate::pool::PoolInner;
use crate::stats::DestroyReason;

/// A borrowed object. Dereferences to the pooled resource.
pub struct Guard<F: Factory> {
    object: Option<F::Object>,
    wrapper: Option<Arc<PooledObject<F::Object>>>,
    pool: Weak<PoolInner<F>>,
}

impl<F: Factory> Guard<F> {
    pub(crate) fn new(
        object: F::Object,
        wrapper: Arc<PooledObject<F::Object>>,
        pool: Weak<PoolInner<F>>,
    ) -> Self {
        Self {
            object: Some(object),
            wrapper: Some(wrapper),
            pool,
        }
    }

    /// How many times the underlying object has been borrowed, this borrow
    /// included.
    #[must_use]
    pub fn borrowed_count(&self) -> u64 {
        self.wrapper
            .as_ref()
            .map(|w| w.borrowed_count())
            .unwrap_or(0)
    }

    /// Record that the object is still in use, deferring abandonment.
    pub fn touch(&self) {
        if let (Some(wrapper), Some(pool)) = (self.wrapper.as_ref(), self.pool.upgrade()) {
            wrapper.touch(pool.now());
        }
    }

    /// Remove the object from the pool permanently and take ownership of it.
    ///
    /// The pool releases the object's capacity as if it had been destroyed;
    /// the caller becomes responsible for tearing the resource down.
    #[must_use]
    pub fn detach(mut self) -> F::Object {
        let object = self.object.take().expect("guard used after dismantle");
        let wrapper = self.wrapper.take().expect("guard used after dismantle");
        if let Some(pool) = self.pool.upgrade() {
            if let Some(claim) = pool.claim_destroy(&wrapper) {
                debug_assert!(claim.object.is_none(), "borrower holds the object");
                pool.finish_destroy(DestroyReason::Normal);
            }
        }
        object
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner<F>>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(pool))
    }

    /// Take the parts out, disarming the drop-return.
    pub(crate) fn dismantle(mut self) -> (Arc<PooledObject<F::Object>>, F::Object) {
        let object = self.object.take().expect("guard used after dismantle");
        let wrapper = self.wrapper.take().expect("guard used after dismantle");
        (wrapper, object)
    }
}

impl<F: Factory> std::ops::Deref for Guard<F> {
    type Target = F::Object;

    fn deref(&self) -> &F::Object {
        self.object.as_ref().expect("guard used after dismantle")
    }
}

impl<F: Factory> std::ops::DerefMut for Guard<F> {
    fn deref_mut(&mut self) -> &mut F::Object {
        self.object.as_mut().expect("guard used after dismantle")
    }
}

impl<F: Factory> Drop for Guard<F> {
    fn drop(&mut self) {
        let (Some(object), Some(wrapper)) = (self.object.take(), self.wrapper.take()) else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            trace!("pool dropped before guard; dropping object");
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = pool.put_back_inner(wrapper, object).await {
                        debug!(%error, "implicit return failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to run the factory hooks on. Keep the books
                // straight and let the object drop.
                if let Some(claim) = pool.claim_destroy(&wrapper) {
                    debug_assert!(claim.object.is_none(), "borrower holds the object");
                    pool.finish_destroy(DestroyReason::Normal);
                }
                debug!("guard dropped outside a runtime; object dropped without factory destroy");
            }
        }
    }
}

impl<F: Factory> std::fmt::Debug for Guard<F>
where
    F::Object: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("object", &self.object).finish()
    }
}
