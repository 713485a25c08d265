//! Capacity gate
//!
//! Counted gate bounding live objects. A permit is consumed when creation is
//! authorized and returned only when destruction completes; returning an
//! object to the idle store keeps its permit. Blocked borrowers therefore
//! never wait on the gate itself; they park on the waiter queue and are
//! woken with a retry when a destroy releases a permit.

use tokio::sync::Semaphore;

pub(crate) struct CapacityGate {
    semaphore: Semaphore,
    bound: Option<usize>,
}

impl CapacityGate {
    pub(crate) fn new(bound: Option<usize>) -> Self {
        let permits = bound.unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Semaphore::new(permits),
            bound,
        }
    }

    /// Consume one permit if available.
    pub(crate) fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return one permit.
    pub(crate) fn release(&self) {
        self.semaphore.add_permits(1);
    }

    /// The configured bound, if any.
    pub(crate) fn bound(&self) -> Option<usize> {
        self.bound
    }
}
