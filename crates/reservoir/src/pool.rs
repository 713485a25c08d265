//! Single-keyspace object pool
//!
//! `Pool<F>` keeps a bounded population of objects produced by a
//! [`Factory`], lends them out through RAII [`Guard`]s, and reclaims them on
//! return. Exhausted borrows park on a FIFO waiter queue and are served by
//! direct handoff from returning tasks; a background task evicts stale idle
//! objects and sweeps abandoned ones.
//!
//! All pool state mutations happen under one short-held mutex; factory hooks
//! are never invoked with it held.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::evict::{default_policy, EvictionConfig, EvictionPolicy};
use crate::factory::Factory;
use crate::gate::CapacityGate;
use crate::guard::Guard;
use crate::idle::IdleStore;
use crate::object::{DestroyMode, EndEvictionTest, PoolState, PooledObject};
use crate::stats::{DestroyReason, PoolStats, StatsCore};
use crate::wait::{Handoff, WaitQueue};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything guarded by the pool mutex. Held only for pointer-sized
/// bookkeeping; never across a factory hook or an await.
pub(crate) struct Shared<T> {
    pub(crate) all: HashMap<u64, Arc<PooledObject<T>>>,
    pub(crate) idle: IdleStore<T>,
    pub(crate) waiters: WaitQueue<T>,
    pub(crate) evict_cursor: Option<i64>,
}

impl<T> Shared<T> {
    pub(crate) fn new() -> Self {
        Self {
            all: HashMap::new(),
            idle: IdleStore::new(),
            waiters: WaitQueue::new(),
            evict_cursor: None,
        }
    }

    pub(crate) fn num_active(&self) -> usize {
        self.all.len() - self.idle.len()
    }
}

pub(crate) struct DestroyClaim<T> {
    pub(crate) object: Option<T>,
}

pub(crate) struct PoolInner<F: Factory> {
    factory: F,
    config: PoolConfig,
    policy: Arc<dyn EvictionPolicy<F::Object>>,
    shared: Mutex<Shared<F::Object>>,
    gate: CapacityGate,
    stats: StatsCore,
    closed: AtomicBool,
    next_id: AtomicU64,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl<F: Factory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`Pool`].
pub struct PoolBuilder<F: Factory> {
    factory: F,
    config: PoolConfig,
    policy: Arc<dyn EvictionPolicy<F::Object>>,
}

impl<F: Factory> PoolBuilder<F> {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a custom eviction policy.
    #[must_use]
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy<F::Object>>) -> Self {
        self.policy = policy;
        self
    }

    /// Build the pool.
    ///
    /// When `time_between_eviction_runs` is set this spawns the maintenance
    /// task and must therefore be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid configuration.
    pub fn build(self) -> Result<Pool<F>, F::Error> {
        self.config.validate()?;
        debug!(
            max_total = ?self.config.max_total,
            max_idle = ?self.config.max_idle,
            min_idle = self.config.min_idle,
            "created object pool"
        );
        let inner = Arc::new(PoolInner {
            gate: CapacityGate::new(self.config.max_total),
            factory: self.factory,
            config: self.config,
            policy: self.policy,
            shared: Mutex::new(Shared::new()),
            stats: StatsCore::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
        });
        if inner.config.time_between_eviction_runs.is_some() {
            spawn_maintenance(&inner);
        }
        Ok(Pool { inner })
    }
}

fn spawn_maintenance<F: Factory>(inner: &Arc<PoolInner<F>>) {
    let Some(period) = inner.config.time_between_eviction_runs else {
        return;
    };
    let weak = Arc::downgrade(inner);
    let token = inner.shutdown.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first sweep
        // happens one full period after construction.
        ticks.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticks.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.run_maintenance().await;
        }
        trace!("pool maintenance task stopped");
    });
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Generic single-keyspace object pool.
///
/// Cheap to clone; all clones share the same state.
pub struct Pool<F: Factory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: Factory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Factory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<F: Factory> Pool<F> {
    /// Start building a pool around `factory`.
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder {
            factory,
            config: PoolConfig::default(),
            policy: default_policy(),
        }
    }

    /// Create a pool with the given configuration and the default eviction
    /// policy.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid configuration.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, F::Error> {
        Self::builder(factory).config(config).build()
    }

    /// Borrow an object, waiting up to the configured `max_wait`.
    ///
    /// # Errors
    /// [`Error::Exhausted`] in non-blocking mode, [`Error::Timeout`] past the
    /// deadline, [`Error::Closed`] after [`close`](Self::close), and
    /// [`Error::Factory`] when creation fails for this borrower.
    pub async fn borrow(&self) -> Result<Guard<F>, F::Error> {
        self.borrow_with(self.inner.config.max_wait).await
    }

    /// Borrow an object with an explicit wait bound (`None` = wait forever).
    pub async fn borrow_with(&self, max_wait: Option<Duration>) -> Result<Guard<F>, F::Error> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        if inner.config.abandoned.remove_on_borrow && inner.near_saturation() {
            inner.remove_abandoned().await;
        }

        let started = Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        // Set once this borrower has been woken from the queue; the head
        // waiter does not re-queue behind later arrivals in fair mode.
        let mut woken = false;

        loop {
            if inner.is_closed() {
                return Err(Error::Closed);
            }

            let must_queue = inner.config.fair && !woken && {
                let shared = inner.shared.lock();
                !shared.waiters.is_empty()
            };

            if !must_queue {
                // 1. Idle store.
                let now = inner.now();
                let candidate = {
                    let mut shared = inner.shared.lock();
                    loop {
                        match shared.idle.take_first() {
                            Some(p) if p.try_allocate(now) => break Some(p),
                            // Lost to the evictor (it will re-offer at the
                            // head) or to a destroy; move on.
                            Some(_) => continue,
                            None => break None,
                        }
                    }
                };
                if let Some(p) = candidate {
                    let idle_for = Duration::from_nanos(p.idle_nanos(now));
                    match inner.ready_for_handout(&p).await {
                        Prepared::Ready(object) => {
                            return Ok(self.finish_borrow(p, object, started, Some(idle_for)));
                        }
                        Prepared::Retry => continue,
                    }
                }

                // 2. Fresh creation.
                if inner.gate.try_acquire() {
                    let (p, object) = self.create_for_borrow().await?;
                    return Ok(self.finish_borrow(p, object, started, None));
                }

                // 3. Exhausted and not allowed to block.
                if !inner.config.block_when_exhausted {
                    let (active, waiters) = {
                        let shared = inner.shared.lock();
                        (shared.num_active(), shared.waiters.len())
                    };
                    return Err(Error::Exhausted {
                        active,
                        max_total: inner.gate.bound().unwrap_or(usize::MAX),
                        waiters,
                    });
                }
            }

            // 4. Park until a return hands us an object or a destroy frees
            // capacity.
            let (seq, rx) = {
                let mut shared = inner.shared.lock();
                shared.waiters.enqueue()
            };
            let mut registration = WaitRegistration {
                pool: Arc::clone(inner),
                seq,
                rx: Some(rx),
            };
            if inner.is_closed() {
                // close() may have drained the queue before this waiter
                // parked; the registration cleans the entry up.
                drop(registration);
                return Err(Error::Closed);
            }
            let rx_ref = registration
                .rx
                .as_mut()
                .expect("registration holds its receiver");
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx_ref).await {
                    Ok(received) => received,
                    Err(_) => {
                        // The registration's drop salvages a racing handoff.
                        drop(registration);
                        return Err(Error::Timeout {
                            waited: started.elapsed(),
                        });
                    }
                },
                None => rx_ref.await,
            };
            registration.disarm();
            woken = true;

            match received {
                Ok(Handoff::Object(p)) => {
                    let now = inner.now();
                    if !p.try_allocate(now) {
                        // The evictor claimed the handed object first; it
                        // will re-offer or destroy it.
                        continue;
                    }
                    let idle_for = Duration::from_nanos(p.idle_nanos(now));
                    match inner.ready_for_handout(&p).await {
                        Prepared::Ready(object) => {
                            return Ok(self.finish_borrow(p, object, started, Some(idle_for)));
                        }
                        Prepared::Retry => continue,
                    }
                }
                Ok(Handoff::Retry) => continue,
                Ok(Handoff::Closed) => return Err(Error::Closed),
                Err(_) => {
                    // Sender vanished without a handoff; only plausible
                    // around close.
                    if inner.is_closed() {
                        return Err(Error::Closed);
                    }
                    continue;
                }
            }
        }
    }

    /// Create an object for the current borrower. Capacity has already been
    /// acquired; it is released on every failure path.
    async fn create_for_borrow(
        &self,
    ) -> Result<(Arc<PooledObject<F::Object>>, F::Object), F::Error> {
        let inner = &self.inner;
        let object = match inner.factory.create().await {
            Ok(object) => object,
            Err(error) => {
                inner.gate.release();
                inner.wake_one();
                return Err(Error::Factory(error));
            }
        };
        let now = inner.now();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let p = Arc::new(PooledObject::new(id, object, now));
        {
            let mut shared = inner.shared.lock();
            shared.all.insert(id, Arc::clone(&p));
        }
        inner.stats.on_created();
        trace!(id, "created pooled object");

        p.try_allocate(now);
        let mut object = p.take_object().expect("fresh wrapper owns its object");
        if inner.config.test_on_create && !inner.factory.validate(&mut object).await {
            inner
                .destroy_with_object(&p, object, DestroyMode::Normal, DestroyReason::BorrowValidation)
                .await;
            return Err(Error::illegal("newly created object failed validation"));
        }
        Ok((p, object))
    }

    fn finish_borrow(
        &self,
        p: Arc<PooledObject<F::Object>>,
        object: F::Object,
        started: Instant,
        idle_for: Option<Duration>,
    ) -> Guard<F> {
        if self.inner.config.abandoned.log_abandoned {
            p.set_borrow_trace(Some(Backtrace::force_capture().to_string()));
        }
        self.inner.stats.on_borrowed(started.elapsed(), idle_for);
        Guard::new(object, p, Arc::downgrade(&self.inner))
    }

    /// Return a borrowed object to the pool.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the object belongs to a different pool or
    /// is no longer checked out (it was reclaimed as abandoned); the object
    /// is destroyed either way.
    pub async fn put_back(&self, guard: Guard<F>) -> Result<(), F::Error> {
        if !guard.belongs_to(&self.inner) {
            // The still-armed guard routes the object back to its own pool.
            return Err(Error::illegal("object does not belong to this pool"));
        }
        let (p, object) = guard.dismantle();
        self.inner.put_back_inner(p, object).await
    }

    /// Destroy a borrowed object instead of returning it.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the object belongs to a different pool or
    /// was already reclaimed; destruction still happens.
    pub async fn invalidate(&self, guard: Guard<F>) -> Result<(), F::Error> {
        if !guard.belongs_to(&self.inner) {
            return Err(Error::illegal("object does not belong to this pool"));
        }
        let (p, object) = guard.dismantle();
        // The claim inside destroy_with_object is the synchronization
        // point; a racing sweeper either wins it or we do.
        let was_tracked = self
            .inner
            .destroy_with_object(&p, object, DestroyMode::Normal, DestroyReason::Normal)
            .await;
        if was_tracked {
            Ok(())
        } else {
            Err(Error::illegal(
                "invalidated object was no longer part of this pool",
            ))
        }
    }

    /// Create one idle object ahead of demand, respecting capacity.
    ///
    /// # Errors
    /// [`Error::Closed`] after close, [`Error::Factory`] when creation fails.
    pub async fn add(&self) -> Result<(), F::Error> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        if !inner.gate.try_acquire() {
            return Ok(());
        }
        inner.create_idle().await
    }

    /// Create idle objects until `min_idle` is satisfied or capacity runs
    /// out. Also run by the maintenance task after each sweep.
    pub async fn ensure_min_idle(&self) {
        self.inner.ensure_min_idle().await;
    }

    /// Run one eviction sweep, as the maintenance task would.
    pub async fn evict(&self) {
        self.inner.evict_once().await;
    }

    /// Destroy every idle object. Borrowed objects are unaffected.
    pub async fn clear(&self) {
        loop {
            let p = {
                let mut shared = self.inner.shared.lock();
                shared.idle.take_first()
            };
            match p {
                Some(p) => {
                    self.inner
                        .destroy(&p, DestroyMode::Normal, DestroyReason::Normal)
                        .await;
                }
                None => break,
            }
        }
    }

    /// Close the pool: fail parked borrows, destroy all idle objects, and
    /// destroy borrowed objects as they come back.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing pool");
        inner.shutdown.cancel();
        let drained = {
            let mut shared = inner.shared.lock();
            shared.waiters.close_all();
            shared.idle.drain()
        };
        for p in drained {
            inner
                .destroy(&p, DestroyMode::Normal, DestroyReason::Normal)
                .await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Objects currently checked out.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.inner.shared.lock().num_active()
    }

    /// Objects currently idle.
    #[must_use]
    pub fn num_idle(&self) -> usize {
        self.inner.shared.lock().idle.len()
    }

    /// Borrowers currently parked.
    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.inner.shared.lock().waiters.len()
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (active, idle, waiters) = {
            let shared = self.inner.shared.lock();
            (shared.num_active(), shared.idle.len(), shared.waiters.len())
        };
        self.inner.stats.snapshot(active, idle, waiters)
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

// ---------------------------------------------------------------------------
// Borrow plumbing
// ---------------------------------------------------------------------------

enum Prepared<T> {
    Ready(T),
    Retry,
}

/// Registration of a parked borrower. Dropping it (timeout or cancellation)
/// unparks cleanly: the queue entry is removed and a handoff that raced the
/// cancellation is salvaged instead of leaked.
struct WaitRegistration<F: Factory> {
    pool: Arc<PoolInner<F>>,
    seq: u64,
    rx: Option<oneshot::Receiver<Handoff<F::Object>>>,
}

impl<F: Factory> WaitRegistration<F> {
    fn disarm(&mut self) {
        self.rx = None;
    }
}

impl<F: Factory> Drop for WaitRegistration<F> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else { return };
        rx.close();
        {
            let mut shared = self.pool.shared.lock();
            shared.waiters.remove(self.seq);
        }
        match rx.try_recv() {
            Ok(Handoff::Object(p)) => PoolInner::salvage(&self.pool, p),
            Ok(Handoff::Retry) => self.pool.wake_one(),
            _ => {}
        }
    }
}

impl<F: Factory> PoolInner<F> {
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wake_one(&self) {
        let mut shared = self.shared.lock();
        shared.waiters.wake_retry();
    }

    /// Activate and optionally validate an allocated object before handing
    /// it to the borrower. `Retry` means the object was destroyed and the
    /// borrow loop should continue.
    async fn ready_for_handout(&self, p: &Arc<PooledObject<F::Object>>) -> Prepared<F::Object> {
        let Some(mut object) = p.take_object() else {
            // Slot unexpectedly empty; retire the wrapper.
            self.destroy(p, DestroyMode::Normal, DestroyReason::Normal).await;
            return Prepared::Retry;
        };
        if let Err(error) = self.factory.activate(&mut object).await {
            debug!(id = p.id(), %error, "activation failed; destroying");
            self.destroy_with_object(p, object, DestroyMode::Normal, DestroyReason::BorrowValidation)
                .await;
            return Prepared::Retry;
        }
        if self.config.test_on_borrow && !self.factory.validate(&mut object).await {
            debug!(id = p.id(), "borrow validation failed; destroying");
            self.destroy_with_object(p, object, DestroyMode::Normal, DestroyReason::BorrowValidation)
                .await;
            return Prepared::Retry;
        }
        Prepared::Ready(object)
    }

    /// The return path shared by [`Pool::put_back`] and guard drops.
    pub(crate) async fn put_back_inner(
        &self,
        p: Arc<PooledObject<F::Object>>,
        mut object: F::Object,
    ) -> Result<(), F::Error> {
        let now = self.now();
        let active_for = Duration::from_nanos(p.active_nanos(now));

        if !p.start_returning() {
            // Not checked out any more: reclaimed by the abandonment
            // sweeper, or already invalid.
            self.factory.destroy(object, DestroyMode::Abandoned).await;
            return Err(Error::illegal(
                "returned object is no longer checked out from this pool",
            ));
        }

        if self.config.test_on_return {
            p.begin_return_validation();
            let ok = self.factory.validate(&mut object).await;
            p.end_return_validation();
            if !ok {
                debug!(id = p.id(), "return validation failed; destroying");
                self.destroy_with_object(&p, object, DestroyMode::Normal, DestroyReason::Normal)
                    .await;
                self.stats.on_returned(active_for);
                return Ok(());
            }
        }

        if let Err(error) = self.factory.passivate(&mut object).await {
            debug!(id = p.id(), %error, "passivation failed; destroying");
            self.destroy_with_object(&p, object, DestroyMode::Normal, DestroyReason::Normal)
                .await;
            self.stats.on_returned(active_for);
            return Ok(());
        }

        p.put_object(object);
        if !p.deallocate(now) {
            // Returning is owned by this task, so this only happens if a
            // destroy claim raced in; make sure the resource goes with it.
            if let Some(object) = p.take_object() {
                self.factory.destroy(object, DestroyMode::Normal).await;
            }
            self.stats.on_returned(active_for);
            return Ok(());
        }

        let surplus = {
            let mut shared = self.shared.lock();
            if self.is_closed() {
                Some(p)
            } else {
                match shared.waiters.offer(Arc::clone(&p)) {
                    None => None,
                    Some(back) => {
                        let max_idle_reached = self
                            .config
                            .max_idle
                            .is_some_and(|max_idle| shared.idle.len() >= max_idle);
                        if max_idle_reached {
                            Some(back)
                        } else {
                            if self.config.lifo {
                                shared.idle.add_first(back);
                            } else {
                                shared.idle.add_last(back);
                            }
                            None
                        }
                    }
                }
            }
        };
        if let Some(p) = surplus {
            self.destroy(&p, DestroyMode::Normal, DestroyReason::Normal).await;
        }
        self.stats.on_returned(active_for);
        Ok(())
    }

    /// Re-home an object whose waiter vanished mid-handoff.
    fn salvage(inner: &Arc<Self>, p: Arc<PooledObject<F::Object>>) {
        {
            let mut shared = inner.shared.lock();
            if !inner.is_closed() {
                inner.offer_or_idle_locked(&mut shared, p, true);
                return;
            }
        }
        // Pool closed underneath the handoff: destroy, on the runtime if
        // one is available.
        if let Some(claim) = inner.claim_destroy(&p) {
            if let Some(object) = claim.object {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let inner = Arc::clone(inner);
                        handle.spawn(async move {
                            inner.factory.destroy(object, DestroyMode::Normal).await;
                        });
                    }
                    Err(_) => drop(object),
                }
            }
            inner.finish_destroy(DestroyReason::Normal);
        }
    }

    /// Hand `p` (Idle, slot filled) to a waiter, or place it in the idle
    /// store. `front` re-offers at the borrow end regardless of discipline.
    fn offer_or_idle_locked(
        &self,
        shared: &mut Shared<F::Object>,
        p: Arc<PooledObject<F::Object>>,
        front: bool,
    ) {
        if let Some(back) = shared.waiters.offer(p) {
            if front || self.config.lifo {
                shared.idle.add_first(back);
            } else {
                shared.idle.add_last(back);
            }
        }
    }

    /// Claim destruction of `p`: flip it to `Invalid` and detach it from the
    /// pool's indexes. Returns `None` when another task already claimed it.
    pub(crate) fn claim_destroy(&self, p: &Arc<PooledObject<F::Object>>) -> Option<DestroyClaim<F::Object>> {
        let previous = p.invalidate();
        if previous == PoolState::Invalid {
            return None;
        }
        {
            let mut shared = self.shared.lock();
            shared.idle.remove(p.id());
            shared.all.remove(&p.id());
        }
        Some(DestroyClaim {
            object: p.take_object(),
        })
    }

    /// Post-destroy accounting: counters, capacity, and one waiter wake so
    /// the freed slot is claimed promptly.
    pub(crate) fn finish_destroy(&self, reason: DestroyReason) {
        self.stats.on_destroyed(reason);
        self.gate.release();
        self.wake_one();
    }

    /// Destroy `p` when its object (if any) still sits in the wrapper.
    pub(crate) async fn destroy(
        &self,
        p: &Arc<PooledObject<F::Object>>,
        mode: DestroyMode,
        reason: DestroyReason,
    ) -> bool {
        let Some(claim) = self.claim_destroy(p) else {
            return false;
        };
        if let Some(object) = claim.object {
            self.factory.destroy(object, mode).await;
        }
        trace!(id = p.id(), ?reason, "destroyed pooled object");
        self.finish_destroy(reason);
        true
    }

    /// Destroy `p` when the caller holds its object. Returns whether this
    /// call performed the live claim; `false` means another task (the
    /// abandonment sweeper) had already reclaimed the wrapper and only the
    /// resource itself remained to tear down.
    async fn destroy_with_object(
        &self,
        p: &Arc<PooledObject<F::Object>>,
        object: F::Object,
        mode: DestroyMode,
        reason: DestroyReason,
    ) -> bool {
        match self.claim_destroy(p) {
            Some(claim) => {
                debug_assert!(claim.object.is_none(), "caller holds the object");
                self.factory.destroy(object, mode).await;
                self.finish_destroy(reason);
                true
            }
            None => {
                // Already claimed (abandonment); the accounting is done,
                // only the resource itself remains.
                self.factory.destroy(object, mode).await;
                false
            }
        }
    }

    /// Create one idle object; capacity must already be acquired.
    async fn create_idle(&self) -> Result<(), F::Error> {
        let mut object = match self.factory.create().await {
            Ok(object) => object,
            Err(error) => {
                self.gate.release();
                self.wake_one();
                return Err(Error::Factory(error));
            }
        };
        if let Err(error) = self.factory.passivate(&mut object).await {
            debug!(%error, "passivation of pre-created object failed");
            self.gate.release();
            self.wake_one();
            return Err(Error::Factory(error));
        }
        let now = self.now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let p = Arc::new(PooledObject::new(id, object, now));
        self.stats.on_created();
        let mut shared = self.shared.lock();
        shared.all.insert(id, Arc::clone(&p));
        self.offer_or_idle_locked(&mut shared, p, false);
        Ok(())
    }

    async fn ensure_min_idle(&self) {
        let min_idle = self.config.min_idle;
        if min_idle == 0 {
            return;
        }
        loop {
            if self.is_closed() {
                return;
            }
            {
                let shared = self.shared.lock();
                if shared.idle.len() >= min_idle {
                    return;
                }
            }
            if !self.gate.try_acquire() {
                return;
            }
            if let Err(error) = self.create_idle().await {
                debug!(%error, "min-idle refill stopped");
                return;
            }
        }
    }

    fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig {
            min_evictable_idle_time: self.config.min_evictable_idle_time,
            soft_min_evictable_idle_time: self.config.soft_min_evictable_idle_time,
            min_idle: self.config.min_idle,
        }
    }

    /// How many idle objects one sweep visits.
    fn tests_per_run(&self, idle_count: usize) -> usize {
        let n = self.config.num_tests_per_eviction_run;
        if n >= 0 {
            (n as usize).min(idle_count)
        } else {
            idle_count.div_ceil(n.unsigned_abs() as usize)
        }
    }

    pub(crate) async fn evict_once(&self) {
        let now = self.now();
        let (candidates, idle_count) = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let idle_count = shared.idle.len();
            let n = self.tests_per_run(idle_count);
            let batch = shared
                .idle
                .eviction_batch(&mut shared.evict_cursor, n, self.config.lifo);
            (batch, idle_count)
        };
        if candidates.is_empty() {
            return;
        }
        let eviction_config = self.eviction_config();
        for p in candidates {
            if !p.start_eviction_test() {
                // A borrower owns it now.
                continue;
            }
            if self.config.test_while_idle && p.begin_idle_validation() {
                let valid = match p.take_object() {
                    Some(mut object) => {
                        let valid = self.factory.validate(&mut object).await;
                        p.put_object(object);
                        valid
                    }
                    None => false,
                };
                if !valid {
                    debug!(id = p.id(), "idle validation failed; evicting");
                    self.destroy(&p, DestroyMode::Normal, DestroyReason::Evictor).await;
                    continue;
                }
            }
            if self.policy.evict(&eviction_config, &p, idle_count, now) {
                self.destroy(&p, DestroyMode::Normal, DestroyReason::Evictor).await;
                continue;
            }
            match p.end_eviction_test() {
                EndEvictionTest::InPlace => {}
                EndEvictionTest::ReturnToHead => {
                    let mut shared = self.shared.lock();
                    self.offer_or_idle_locked(&mut shared, Arc::clone(&p), true);
                }
                EndEvictionTest::Lost => {}
            }
        }
    }

    /// Whether the borrow-path abandonment trigger should fire.
    fn near_saturation(&self) -> bool {
        let Some(max_total) = self.gate.bound() else {
            return false;
        };
        let shared = self.shared.lock();
        shared.idle.len() < 2 && shared.num_active() > max_total.saturating_sub(3)
    }

    pub(crate) async fn remove_abandoned(&self) {
        let timeout = self.config.abandoned.timeout;
        let now = self.now();
        let threshold = now.saturating_sub(timeout.as_nanos() as u64);
        let candidates: Vec<Arc<PooledObject<F::Object>>> = {
            let shared = self.shared.lock();
            shared
                .all
                .values()
                .filter(|p| p.state() == PoolState::Allocated && p.last_used() <= threshold)
                .map(Arc::clone)
                .collect()
        };
        for p in candidates {
            if !p.mark_abandoned() {
                continue;
            }
            match p.take_borrow_trace() {
                Some(trace) if self.config.abandoned.log_abandoned => {
                    warn!(id = p.id(), borrowed_at = %trace, "reclaiming abandoned object");
                }
                _ => {
                    debug!(id = p.id(), "reclaiming abandoned object");
                }
            }
            // The borrower still holds the resource; the factory destroy
            // runs when its stale guard comes back. Accounting and capacity
            // are settled now.
            if let Some(claim) = self.claim_destroy(&p) {
                if let Some(object) = claim.object {
                    self.factory.destroy(object, DestroyMode::Abandoned).await;
                }
                self.finish_destroy(DestroyReason::Abandonment);
            }
        }
    }

    async fn run_maintenance(&self) {
        self.evict_once().await;
        if self.config.abandoned.remove_on_maintenance {
            self.remove_abandoned().await;
        }
        self.ensure_min_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbandonedConfig;

    use std::sync::atomic::AtomicU32;

    fn assert_send_sync<T: Send + Sync>() {}

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(&'static str);

    /// Counter-backed factory with failure knobs.
    struct TestFactory {
        counter: AtomicU32,
        fail_creates: AtomicU32,
        valid: AtomicBool,
        destroyed: Mutex<Vec<(u32, DestroyMode)>>,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                counter: AtomicU32::new(0),
                fail_creates: AtomicU32::new(0),
                valid: AtomicBool::new(true),
                destroyed: Mutex::new(Vec::new()),
            }
        }

        fn destroyed(&self) -> Vec<(u32, DestroyMode)> {
            self.destroyed.lock().clone()
        }
    }

    impl Factory for Arc<TestFactory> {
        type Object = u32;
        type Error = TestError;

        async fn create(&self) -> std::result::Result<u32, TestError> {
            if self.fail_creates.load(Ordering::SeqCst) > 0 {
                self.fail_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(TestError("create failed"));
            }
            Ok(self.counter.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _object: &mut u32) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        async fn destroy(&self, object: u32, mode: DestroyMode) {
            self.destroyed.lock().push((object, mode));
        }
    }

    fn pool_with(config: PoolConfig) -> (Pool<Arc<TestFactory>>, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::new());
        let pool = Pool::new(Arc::clone(&factory), config).unwrap();
        (pool, factory)
    }

    #[test]
    fn pool_and_guard_are_send_sync() {
        assert_send_sync::<Pool<Arc<TestFactory>>>();
        assert_send_sync::<Guard<Arc<TestFactory>>>();
    }

    #[tokio::test]
    async fn borrow_creates_and_reuses() {
        let (pool, _) = pool_with(PoolConfig::default());
        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 0);
        assert_eq!(pool.num_active(), 1);
        pool.put_back(guard).await.unwrap();
        assert_eq!(pool.num_idle(), 1);

        // LIFO: same object comes back.
        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 0);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn non_blocking_exhaustion() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(1),
            block_when_exhausted: false,
            ..Default::default()
        });
        let g1 = pool.borrow().await.unwrap();
        match pool.borrow().await {
            Err(Error::Exhausted {
                active, max_total, ..
            }) => {
                assert_eq!(active, 1);
                assert_eq!(max_total, 1);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        pool.put_back(g1).await.unwrap();
        let _g2 = pool.borrow().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_borrow_times_out() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(1),
            max_wait: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let _g1 = pool.borrow().await.unwrap();
        match pool.borrow().await {
            Err(Error::Timeout { waited }) => assert!(waited >= Duration::from_millis(50)),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(pool.num_waiters(), 0, "timed-out waiter must unregister");
    }

    #[tokio::test]
    async fn return_hands_off_to_waiter() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(1),
            ..Default::default()
        });
        let g1 = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|g| *g) })
        };
        // Let the waiter park.
        tokio::task::yield_now().await;
        pool.put_back(g1).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, 0, "waiter receives the returned object by handoff");
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn create_failure_surfaces_and_releases_capacity() {
        let (pool, factory) = pool_with(PoolConfig {
            max_total: Some(1),
            ..Default::default()
        });
        factory.fail_creates.store(1, Ordering::SeqCst);
        match pool.borrow().await {
            Err(Error::Factory(source)) => assert_eq!(source.to_string(), "create failed"),
            other => panic!("expected Factory, got {other:?}"),
        }
        // Capacity was released: the next borrow succeeds.
        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 0);
    }

    #[tokio::test]
    async fn borrow_validation_destroys_and_retries() {
        let (pool, factory) = pool_with(PoolConfig {
            test_on_borrow: true,
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        pool.put_back(guard).await.unwrap();

        // The idle object now fails validation: borrow destroys it and
        // falls through to fresh creation (only test_on_create validates
        // fresh objects).
        factory.valid.store(false, Ordering::SeqCst);
        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 1, "fresh replacement instance");
        let stats = pool.stats();
        assert_eq!(stats.destroyed_by_borrow_validation, 1);
    }

    #[tokio::test]
    async fn return_validation_destroys() {
        let (pool, factory) = pool_with(PoolConfig {
            test_on_return: true,
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        factory.valid.store(false, Ordering::SeqCst);
        pool.put_back(guard).await.unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(pool.stats().returned, 1);
    }

    #[tokio::test]
    async fn max_idle_overflow_is_destroyed() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(4),
            max_idle: Some(1),
            ..Default::default()
        });
        let g1 = pool.borrow().await.unwrap();
        let g2 = pool.borrow().await.unwrap();
        pool.put_back(g1).await.unwrap();
        pool.put_back(g2).await.unwrap();
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn invalidate_destroys_and_frees_capacity() {
        let (pool, factory) = pool_with(PoolConfig {
            max_total: Some(1),
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        pool.invalidate(guard).await.unwrap();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(factory.destroyed(), vec![(0, DestroyMode::Normal)]);

        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 1);
    }

    #[tokio::test]
    async fn double_return_is_illegal_after_sweep() {
        let (pool, factory) = pool_with(PoolConfig {
            abandoned: AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.inner.remove_abandoned().await;
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.stats().destroyed_by_abandonment, 1);

        match pool.put_back(guard).await {
            Err(Error::IllegalState { .. }) => {}
            other => panic!("expected IllegalState, got {other:?}"),
        }
        // The stale object was torn down in abandoned mode.
        assert_eq!(factory.destroyed(), vec![(0, DestroyMode::Abandoned)]);
    }

    #[tokio::test]
    async fn invalidate_after_sweep_is_illegal() {
        let (pool, factory) = pool_with(PoolConfig {
            abandoned: AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.inner.remove_abandoned().await;

        // The sweeper won the claim; invalidate must say so.
        match pool.invalidate(guard).await {
            Err(Error::IllegalState { .. }) => {}
            other => panic!("expected IllegalState, got {other:?}"),
        }
        // The resource itself was still torn down, exactly once.
        assert_eq!(factory.destroyed().len(), 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn clear_destroys_idle_only() {
        let (pool, _) = pool_with(PoolConfig::default());
        let g = pool.borrow().await.unwrap();
        let g2 = pool.borrow().await.unwrap();
        pool.put_back(g2).await.unwrap();
        pool.clear().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 1);
        pool.put_back(g).await.unwrap();
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_destroys_returns() {
        let (pool, factory) = pool_with(PoolConfig {
            max_total: Some(1),
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        pool.close().await;
        match waiter.await.unwrap() {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }

        // A borrowed object coming back after close is destroyed.
        pool.put_back(guard).await.unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(factory.destroyed().len(), 1);

        match pool.borrow().await {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_and_min_idle_refill() {
        let (pool, _) = pool_with(PoolConfig {
            min_idle: 2,
            max_total: Some(4),
            ..Default::default()
        });
        pool.add().await.unwrap();
        assert_eq!(pool.num_idle(), 1);
        pool.ensure_min_idle().await;
        assert_eq!(pool.num_idle(), 2);
        // Idempotent once satisfied.
        pool.ensure_min_idle().await;
        assert_eq!(pool.num_idle(), 2);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn evict_respects_policy_and_cursor() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(8),
            min_evictable_idle_time: Some(Duration::ZERO),
            num_tests_per_eviction_run: 2,
            ..Default::default()
        });
        let guards: Vec<_> = [
            pool.borrow().await.unwrap(),
            pool.borrow().await.unwrap(),
            pool.borrow().await.unwrap(),
        ]
        .into();
        for guard in guards {
            pool.put_back(guard).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(pool.num_idle(), 3);
        pool.evict().await;
        assert_eq!(pool.num_idle(), 1, "visits num_tests_per_eviction_run");
        pool.evict().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.stats().destroyed_by_evictor, 3);
    }

    #[tokio::test]
    async fn negative_num_tests_visits_a_share() {
        let (pool, _) = pool_with(PoolConfig {
            max_total: Some(8),
            min_evictable_idle_time: Some(Duration::ZERO),
            num_tests_per_eviction_run: -2,
            ..Default::default()
        });
        // Hold four guards at once so four distinct objects exist.
        let gs = [
            pool.borrow().await.unwrap(),
            pool.borrow().await.unwrap(),
            pool.borrow().await.unwrap(),
            pool.borrow().await.unwrap(),
        ];
        for g in gs {
            pool.put_back(g).await.unwrap();
        }
        assert_eq!(pool.num_idle(), 4);
        pool.evict().await;
        // ceil(4 / 2) = 2 visited, all evictable.
        assert_eq!(pool.num_idle(), 2);
    }

    #[tokio::test]
    async fn eviction_race_returns_object_to_head() {
        let (pool, _) = pool_with(PoolConfig::default());
        let g = pool.borrow().await.unwrap();
        pool.put_back(g).await.unwrap();

        let p = {
            let shared = pool.inner.shared.lock();
            shared.all.values().next().map(Arc::clone).unwrap()
        };
        // Simulate the evictor mid-test.
        assert!(p.start_eviction_test());

        // The borrow skips the object under test and creates a fresh one.
        let g = pool.borrow().await.unwrap();
        assert_eq!(*g, 1);
        assert_eq!(p.state(), PoolState::EvictionReturnToHead);

        // Evictor finishes: the object is re-offered at the head.
        assert_eq!(p.end_eviction_test(), EndEvictionTest::ReturnToHead);
        {
            let mut shared = pool.inner.shared.lock();
            pool.inner.offer_or_idle_locked(&mut shared, Arc::clone(&p), true);
        }
        assert_eq!(pool.num_idle(), 1);
        let g2 = pool.borrow().await.unwrap();
        assert_eq!(*g2, 0, "the raced object is borrowable again");
    }

    #[tokio::test]
    async fn guard_drop_returns_on_a_task() {
        let (pool, _) = pool_with(PoolConfig::default());
        {
            let _guard = pool.borrow().await.unwrap();
        }
        // Drop returns via a spawned task.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.stats().returned, 1);
    }

    #[tokio::test]
    async fn detach_releases_capacity() {
        let (pool, factory) = pool_with(PoolConfig {
            max_total: Some(1),
            ..Default::default()
        });
        let guard = pool.borrow().await.unwrap();
        let raw = guard.detach();
        assert_eq!(raw, 0);
        assert_eq!(pool.num_active(), 0);
        assert!(factory.destroyed().is_empty(), "caller owns the object now");
        // Capacity is free again.
        let _g = pool.borrow().await.unwrap();
    }

    #[tokio::test]
    async fn stats_track_borrow_and_return_counts() {
        let (pool, _) = pool_with(PoolConfig::default());
        for _ in 0..3 {
            let g = pool.borrow().await.unwrap();
            pool.put_back(g).await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.borrowed, 3);
        assert_eq!(stats.returned, 3);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.created - stats.destroyed, (stats.num_active + stats.num_idle) as u64);
    }
}
