//! Keyed object pool
//!
//! `KeyedPool<K, F>` manages a family of independent sub-pools indexed by a
//! caller-supplied key, each with its own idle store, waiter queue and
//! per-key capacity gate, under one shared global gate bounding the sum.
//! Sub-pools are created lazily on first reference.
//!
//! Capacity acquisition is two-step, per-key then global; release runs in
//! reverse. When the global gate is tight but another key holds idle
//! objects, the borrow path destroys the oldest idle object under the most
//! loaded other key to transfer the capacity ("clear-oldest").

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::KeyedPoolConfig;
use crate::error::{Error, Result};
use crate::evict::{default_policy, EvictionConfig, EvictionPolicy};
use crate::factory::KeyedFactory;
use crate::gate::CapacityGate;
use crate::object::{DestroyMode, EndEvictionTest, PoolState, PooledObject};
use crate::pool::{DestroyClaim, Shared};
use crate::stats::{DestroyReason, PoolStats, StatsCore};
use crate::wait::{Handoff, WaitQueue};

/// Marker trait for sub-pool keys.
pub trait Key: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Sub-pool
// ---------------------------------------------------------------------------

struct SubPool<T> {
    shared: Mutex<Shared<T>>,
    gate: CapacityGate,
}

impl<T> SubPool<T> {
    fn new(per_key_bound: Option<usize>) -> Self {
        Self {
            shared: Mutex::new(Shared::new()),
            gate: CapacityGate::new(per_key_bound),
        }
    }
}

pub(crate) struct KeyedInner<K: Key, F: KeyedFactory<K>> {
    factory: F,
    config: KeyedPoolConfig,
    policy: Arc<dyn EvictionPolicy<F::Object>>,
    pools: DashMap<K, Arc<SubPool<F::Object>>>,
    global_gate: CapacityGate,
    stats: StatsCore,
    closed: AtomicBool,
    next_id: AtomicU64,
    epoch: Instant,
    shutdown: CancellationToken,
    /// Last key visited by the evictor, for round-robin across sub-pools.
    evict_key_cursor: Mutex<Option<K>>,
}

impl<K: Key, F: KeyedFactory<K>> Drop for KeyedInner<K, F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// A borrowed object from a [`KeyedPool`]. Dereferences to the resource.
pub struct KeyedGuard<K: Key, F: KeyedFactory<K>> {
    object: Option<F::Object>,
    wrapper: Option<Arc<PooledObject<F::Object>>>,
    key: K,
    pool: Weak<KeyedInner<K, F>>,
}

impl<K: Key, F: KeyedFactory<K>> KeyedGuard<K, F> {
    /// The key this object was borrowed under.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
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
            if let Some(sub) = pool.existing_subpool(&self.key) {
                if let Some(claim) = KeyedInner::<K, F>::claim_destroy_in(&sub, &wrapper) {
                    debug_assert!(claim.object.is_none(), "borrower holds the object");
                    pool.finish_destroy_in(&self.key, &sub, DestroyReason::Normal);
                }
            }
        }
        object
    }

    fn belongs_to(&self, pool: &Arc<KeyedInner<K, F>>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(pool))
    }

    fn dismantle(mut self) -> (K, Arc<PooledObject<F::Object>>, F::Object) {
        let object = self.object.take().expect("guard used after dismantle");
        let wrapper = self.wrapper.take().expect("guard used after dismantle");
        (self.key.clone(), wrapper, object)
    }
}

impl<K: Key, F: KeyedFactory<K>> std::ops::Deref for KeyedGuard<K, F> {
    type Target = F::Object;

    fn deref(&self) -> &F::Object {
        self.object.as_ref().expect("guard used after dismantle")
    }
}

impl<K: Key, F: KeyedFactory<K>> std::ops::DerefMut for KeyedGuard<K, F> {
    fn deref_mut(&mut self) -> &mut F::Object {
        self.object.as_mut().expect("guard used after dismantle")
    }
}

impl<K: Key, F: KeyedFactory<K>> Drop for KeyedGuard<K, F> {
    fn drop(&mut self) {
        let (Some(object), Some(wrapper)) = (self.object.take(), self.wrapper.take()) else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            trace!("pool dropped before guard; dropping object");
            return;
        };
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = pool.put_back_inner(&key, wrapper, object).await {
                        debug!(%error, "implicit return failed");
                    }
                });
            }
            Err(_) => {
                if let Some(sub) = pool.existing_subpool(&key) {
                    if let Some(claim) = KeyedInner::<K, F>::claim_destroy_in(&sub, &wrapper) {
                        debug_assert!(claim.object.is_none(), "borrower holds the object");
                        pool.finish_destroy_in(&key, &sub, DestroyReason::Normal);
                    }
                }
                debug!("guard dropped outside a runtime; object dropped without factory destroy");
            }
        }
    }
}

impl<K: Key, F: KeyedFactory<K>> std::fmt::Debug for KeyedGuard<K, F>
where
    F::Object: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.key)
            .field("object", &self.object)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`KeyedPool`].
pub struct KeyedPoolBuilder<K: Key, F: KeyedFactory<K>> {
    factory: F,
    config: KeyedPoolConfig,
    policy: Arc<dyn EvictionPolicy<F::Object>>,
    _key: std::marker::PhantomData<K>,
}

impl<K: Key, F: KeyedFactory<K>> KeyedPoolBuilder<K, F> {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: KeyedPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a custom eviction policy.
    #[must_use]
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy<F::Object>>) -> Self {
        self.policy = policy;
        self
    }

    /// Build the pool. Spawns the maintenance task when
    /// `time_between_eviction_runs` is set; call within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid configuration.
    pub fn build(self) -> Result<KeyedPool<K, F>, F::Error> {
        self.config.validate()?;
        debug!(
            max_total = ?self.config.max_total,
            max_total_per_key = ?self.config.max_total_per_key,
            "created keyed object pool"
        );
        let inner = Arc::new(KeyedInner {
            global_gate: CapacityGate::new(self.config.max_total),
            factory: self.factory,
            config: self.config,
            policy: self.policy,
            pools: DashMap::new(),
            stats: StatsCore::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
            evict_key_cursor: Mutex::new(None),
        });
        if inner.config.time_between_eviction_runs.is_some() {
            spawn_maintenance(&inner);
        }
        Ok(KeyedPool { inner })
    }
}

fn spawn_maintenance<K: Key, F: KeyedFactory<K>>(inner: &Arc<KeyedInner<K, F>>) {
    let Some(period) = inner.config.time_between_eviction_runs else {
        return;
    };
    let weak = Arc::downgrade(inner);
    let token = inner.shutdown.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticks.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.run_maintenance().await;
        }
        trace!("keyed pool maintenance task stopped");
    });
}

// ---------------------------------------------------------------------------
// KeyedPool
// ---------------------------------------------------------------------------

/// Keyed object pool: independent sub-pools under a shared global cap.
///
/// Cheap to clone; all clones share the same state.
pub struct KeyedPool<K: Key, F: KeyedFactory<K>> {
    inner: Arc<KeyedInner<K, F>>,
}

impl<K: Key, F: KeyedFactory<K>> Clone for KeyedPool<K, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, F: KeyedFactory<K>> std::fmt::Debug for KeyedPool<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedPool")
            .field("keys", &self.inner.pools.len())
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: Key, F: KeyedFactory<K>> KeyedPool<K, F> {
    /// Start building a keyed pool around `factory`.
    pub fn builder(factory: F) -> KeyedPoolBuilder<K, F> {
        KeyedPoolBuilder {
            factory,
            config: KeyedPoolConfig::default(),
            policy: default_policy(),
            _key: std::marker::PhantomData,
        }
    }

    /// Create a keyed pool with the given configuration and the default
    /// eviction policy.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid configuration.
    pub fn new(factory: F, config: KeyedPoolConfig) -> Result<Self, F::Error> {
        Self::builder(factory).config(config).build()
    }

    /// Borrow an object under `key`, waiting up to the configured
    /// `max_wait`.
    pub async fn borrow(&self, key: K) -> Result<KeyedGuard<K, F>, F::Error> {
        self.borrow_with(key, self.inner.config.max_wait).await
    }

    /// Borrow with an explicit wait bound (`None` = wait forever).
    pub async fn borrow_with(
        &self,
        key: K,
        max_wait: Option<Duration>,
    ) -> Result<KeyedGuard<K, F>, F::Error> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        if inner.config.abandoned.remove_on_borrow && inner.near_saturation() {
            inner.remove_abandoned().await;
        }

        let sub = inner.subpool(&key);
        let started = Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        let mut woken = false;

        loop {
            if inner.is_closed() {
                return Err(Error::Closed);
            }

            let must_queue = inner.config.fair && !woken && {
                let shared = sub.shared.lock();
                !shared.waiters.is_empty()
            };

            if !must_queue {
                // 1. Idle store of this key.
                let now = inner.now();
                let candidate = {
                    let mut shared = sub.shared.lock();
                    loop {
                        match shared.idle.take_first() {
                            Some(p) if p.try_allocate(now) => break Some(p),
                            Some(_) => continue,
                            None => break None,
                        }
                    }
                };
                if let Some(p) = candidate {
                    let idle_for = Duration::from_nanos(p.idle_nanos(now));
                    match inner.ready_for_handout(&key, &sub, &p).await {
                        Prepared::Ready(object) => {
                            return Ok(self.finish_borrow(key, p, object, started, Some(idle_for)));
                        }
                        Prepared::Retry => continue,
                    }
                }

                // 2. Fresh creation: per-key gate, then the global gate,
                // transferring capacity from another key if necessary.
                if sub.gate.try_acquire() {
                    let mut have_global = inner.global_gate.try_acquire();
                    if !have_global && inner.reclaim_idle_capacity(&key).await {
                        have_global = inner.global_gate.try_acquire();
                    }
                    if have_global {
                        let (p, object) = self.create_for_borrow(&key, &sub).await?;
                        return Ok(self.finish_borrow(key, p, object, started, None));
                    }
                    sub.gate.release();
                } else if !inner.config.block_when_exhausted {
                    let (active, waiters) = {
                        let shared = sub.shared.lock();
                        (shared.num_active(), shared.waiters.len())
                    };
                    return Err(Error::Exhausted {
                        active,
                        max_total: inner.config.max_total_per_key.unwrap_or(usize::MAX),
                        waiters,
                    });
                }

                // 3. Globally exhausted and not allowed to block.
                if !inner.config.block_when_exhausted {
                    return Err(Error::Exhausted {
                        active: inner.total_active(),
                        max_total: inner.config.max_total.unwrap_or(usize::MAX),
                        waiters: inner.total_waiters(),
                    });
                }
            }

            // 4. Park on this key's waiter queue.
            let (seq, rx) = {
                let mut shared = sub.shared.lock();
                shared.waiters.enqueue()
            };
            let mut registration = KeyedWaitRegistration {
                pool: Arc::clone(inner),
                key: key.clone(),
                sub: Arc::clone(&sub),
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
                        continue;
                    }
                    let idle_for = Duration::from_nanos(p.idle_nanos(now));
                    match inner.ready_for_handout(&key, &sub, &p).await {
                        Prepared::Ready(object) => {
                            return Ok(self.finish_borrow(key, p, object, started, Some(idle_for)));
                        }
                        Prepared::Retry => continue,
                    }
                }
                Ok(Handoff::Retry) => continue,
                Ok(Handoff::Closed) => return Err(Error::Closed),
                Err(_) => {
                    if inner.is_closed() {
                        return Err(Error::Closed);
                    }
                    continue;
                }
            }
        }
    }

    async fn create_for_borrow(
        &self,
        key: &K,
        sub: &Arc<SubPool<F::Object>>,
    ) -> Result<(Arc<PooledObject<F::Object>>, F::Object), F::Error> {
        let inner = &self.inner;
        let object = match inner.factory.create(key).await {
            Ok(object) => object,
            Err(error) => {
                inner.release_capacity(key, sub);
                return Err(Error::Factory(error));
            }
        };
        let now = inner.now();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let p = Arc::new(PooledObject::new(id, object, now));
        {
            let mut shared = sub.shared.lock();
            shared.all.insert(id, Arc::clone(&p));
        }
        inner.stats.on_created();
        trace!(id, ?key, "created pooled object");

        p.try_allocate(now);
        let mut object = p.take_object().expect("fresh wrapper owns its object");
        if inner.config.test_on_create && !inner.factory.validate(key, &mut object).await {
            inner
                .destroy_with_object_in(
                    key,
                    sub,
                    &p,
                    object,
                    DestroyMode::Normal,
                    DestroyReason::BorrowValidation,
                )
                .await;
            return Err(Error::illegal("newly created object failed validation"));
        }
        Ok((p, object))
    }

    fn finish_borrow(
        &self,
        key: K,
        p: Arc<PooledObject<F::Object>>,
        object: F::Object,
        started: Instant,
        idle_for: Option<Duration>,
    ) -> KeyedGuard<K, F> {
        if self.inner.config.abandoned.log_abandoned {
            p.set_borrow_trace(Some(Backtrace::force_capture().to_string()));
        }
        self.inner.stats.on_borrowed(started.elapsed(), idle_for);
        KeyedGuard {
            object: Some(object),
            wrapper: Some(p),
            key,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Return a borrowed object to its sub-pool.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the object belongs to a different pool or
    /// is no longer checked out; it is destroyed either way.
    pub async fn put_back(&self, guard: KeyedGuard<K, F>) -> Result<(), F::Error> {
        if !guard.belongs_to(&self.inner) {
            return Err(Error::illegal("object does not belong to this pool"));
        }
        let (key, p, object) = guard.dismantle();
        self.inner.put_back_inner(&key, p, object).await
    }

    /// Destroy a borrowed object instead of returning it.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the object belongs to a different pool or
    /// was already reclaimed; destruction still happens.
    pub async fn invalidate(&self, guard: KeyedGuard<K, F>) -> Result<(), F::Error> {
        if !guard.belongs_to(&self.inner) {
            return Err(Error::illegal("object does not belong to this pool"));
        }
        let (key, p, object) = guard.dismantle();
        let sub = self.inner.subpool(&key);
        // The claim inside destroy_with_object_in is the synchronization
        // point; a racing sweeper either wins it or we do.
        let was_tracked = self
            .inner
            .destroy_with_object_in(
                &key,
                &sub,
                &p,
                object,
                DestroyMode::Normal,
                DestroyReason::Normal,
            )
            .await;
        if was_tracked {
            Ok(())
        } else {
            Err(Error::illegal(
                "invalidated object was no longer part of this pool",
            ))
        }
    }

    /// Create one idle object under `key`, respecting both gates.
    ///
    /// # Errors
    /// [`Error::Closed`] after close, [`Error::Factory`] when creation
    /// fails.
    pub async fn add(&self, key: &K) -> Result<(), F::Error> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        let sub = inner.subpool(key);
        if !sub.gate.try_acquire() {
            return Ok(());
        }
        if !inner.global_gate.try_acquire() {
            sub.gate.release();
            return Ok(());
        }
        inner.create_idle_in(key, &sub).await
    }

    /// Register `key` and fill its sub-pool to `min_idle_per_key`.
    ///
    /// # Errors
    /// [`Error::Closed`] after close, [`Error::Factory`] when creation
    /// fails.
    pub async fn prepare(&self, key: &K) -> Result<(), F::Error> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        let sub = inner.subpool(key);
        inner.ensure_min_idle_in(key, &sub).await
    }

    /// Run one eviction sweep across sub-pools, as the maintenance task
    /// would.
    pub async fn evict(&self) {
        self.inner.evict_once().await;
    }

    /// Destroy every idle object under `key` and drop the sub-pool if that
    /// leaves it empty and unwatched.
    pub async fn clear(&self, key: &K) {
        let Some(sub) = self.inner.existing_subpool(key) else {
            return;
        };
        loop {
            let p = {
                let mut shared = sub.shared.lock();
                shared.idle.take_first()
            };
            match p {
                Some(p) => {
                    self.inner
                        .destroy_in(key, &sub, &p, DestroyMode::Normal, DestroyReason::Normal)
                        .await;
                }
                None => break,
            }
        }
        self.inner.pools.remove_if(key, |_, sub| {
            let shared = sub.shared.lock();
            shared.all.is_empty() && shared.waiters.is_empty()
        });
    }

    /// Destroy every idle object under every key.
    pub async fn clear_all(&self) {
        let keys: Vec<K> = self.inner.pools.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.clear(&key).await;
        }
    }

    /// Close the pool: fail parked borrows, destroy all idle objects, and
    /// destroy borrowed objects as they come back.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing keyed pool");
        inner.shutdown.cancel();
        let subs: Vec<(K, Arc<SubPool<F::Object>>)> = inner
            .pools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (key, sub) in subs {
            let drained = {
                let mut shared = sub.shared.lock();
                shared.waiters.close_all();
                shared.idle.drain()
            };
            for p in drained {
                inner
                    .destroy_in(&key, &sub, &p, DestroyMode::Normal, DestroyReason::Normal)
                    .await;
            }
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Total objects checked out, across all keys.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.inner.total_active()
    }

    /// Total idle objects, across all keys.
    #[must_use]
    pub fn num_idle(&self) -> usize {
        self.inner
            .pools
            .iter()
            .map(|e| e.value().shared.lock().idle.len())
            .sum()
    }

    /// Objects checked out under `key`.
    #[must_use]
    pub fn num_active_for(&self, key: &K) -> usize {
        self.inner
            .existing_subpool(key)
            .map(|sub| sub.shared.lock().num_active())
            .unwrap_or(0)
    }

    /// Idle objects under `key`.
    #[must_use]
    pub fn num_idle_for(&self, key: &K) -> usize {
        self.inner
            .existing_subpool(key)
            .map(|sub| sub.shared.lock().idle.len())
            .unwrap_or(0)
    }

    /// Total parked borrowers, across all keys.
    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.inner.total_waiters()
    }

    /// Parked borrowers per key.
    #[must_use]
    pub fn num_waiters_by_key(&self) -> HashMap<K, usize> {
        self.inner
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().shared.lock().waiters.len()))
            .collect()
    }

    /// Keys with a live sub-pool.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.pools.iter().map(|e| e.key().clone()).collect()
    }

    /// Aggregate point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot(
            self.inner.total_active(),
            self.num_idle(),
            self.inner.total_waiters(),
        )
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &KeyedPoolConfig {
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

struct KeyedWaitRegistration<K: Key, F: KeyedFactory<K>> {
    pool: Arc<KeyedInner<K, F>>,
    key: K,
    sub: Arc<SubPool<F::Object>>,
    seq: u64,
    rx: Option<oneshot::Receiver<Handoff<F::Object>>>,
}

impl<K: Key, F: KeyedFactory<K>> KeyedWaitRegistration<K, F> {
    fn disarm(&mut self) {
        self.rx = None;
    }
}

impl<K: Key, F: KeyedFactory<K>> Drop for KeyedWaitRegistration<K, F> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else { return };
        rx.close();
        {
            let mut shared = self.sub.shared.lock();
            shared.waiters.remove(self.seq);
        }
        match rx.try_recv() {
            Ok(Handoff::Object(p)) => {
                KeyedInner::salvage(&self.pool, &self.key, &self.sub, p);
            }
            Ok(Handoff::Retry) => {
                self.pool.wake_after_destroy(&self.key);
            }
            _ => {}
        }
    }
}

impl<K: Key, F: KeyedFactory<K>> KeyedInner<K, F> {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sub-pool for `key`, created lazily.
    fn subpool(&self, key: &K) -> Arc<SubPool<F::Object>> {
        if let Some(sub) = self.pools.get(key) {
            return Arc::clone(sub.value());
        }
        Arc::clone(
            self.pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SubPool::new(self.config.max_total_per_key)))
                .value(),
        )
    }

    fn existing_subpool(&self, key: &K) -> Option<Arc<SubPool<F::Object>>> {
        self.pools.get(key).map(|sub| Arc::clone(sub.value()))
    }

    fn total_active(&self) -> usize {
        self.pools
            .iter()
            .map(|e| e.value().shared.lock().num_active())
            .sum()
    }

    fn total_waiters(&self) -> usize {
        self.pools
            .iter()
            .map(|e| e.value().shared.lock().waiters.len())
            .sum()
    }

    /// Release one unit of capacity acquired for `key` (reverse of the
    /// acquisition order) and wake a borrower that can use it.
    fn release_capacity(&self, key: &K, sub: &SubPool<F::Object>) {
        self.global_gate.release();
        sub.gate.release();
        self.wake_after_destroy(key);
    }

    /// Wake one parked borrower after capacity was freed under `key`:
    /// same-key waiters first, then the key with the most waiters (the
    /// most-loaded key gets the transferred capacity).
    fn wake_after_destroy(&self, key: &K) {
        if let Some(sub) = self.existing_subpool(key) {
            if sub.shared.lock().waiters.wake_retry() {
                return;
            }
        }
        let mut best: Option<(usize, Arc<SubPool<F::Object>>)> = None;
        for entry in self.pools.iter() {
            if entry.key() == key {
                continue;
            }
            let waiting = entry.value().shared.lock().waiters.len();
            if waiting > 0 && best.as_ref().is_none_or(|(most, _)| waiting > *most) {
                best = Some((waiting, Arc::clone(entry.value())));
            }
        }
        if let Some((_, sub)) = best {
            sub.shared.lock().waiters.wake_retry();
        }
    }

    /// Destroy the oldest idle object under the most loaded other key to
    /// free one unit of global capacity. Returns whether anything was
    /// destroyed.
    async fn reclaim_idle_capacity(&self, except: &K) -> bool {
        let mut victim: Option<(usize, u64, K, Arc<SubPool<F::Object>>, Arc<PooledObject<F::Object>>)> =
            None;
        let now = self.now();
        for entry in self.pools.iter() {
            if entry.key() == except {
                continue;
            }
            let sub = entry.value();
            let (active, oldest) = {
                let shared = sub.shared.lock();
                (shared.num_active(), shared.idle.oldest(self.config.lifo))
            };
            let Some(oldest) = oldest else { continue };
            let idle_age = oldest.idle_nanos(now);
            let better = match &victim {
                None => true,
                Some((best_active, best_age, ..)) => {
                    active > *best_active || (active == *best_active && idle_age > *best_age)
                }
            };
            if better {
                victim = Some((active, idle_age, entry.key().clone(), Arc::clone(sub), oldest));
            }
        }
        match victim {
            Some((_, _, key, sub, p)) => {
                debug!(?key, id = p.id(), "transferring capacity from most-loaded key");
                self.destroy_in(&key, &sub, &p, DestroyMode::Normal, DestroyReason::Normal)
                    .await
            }
            None => false,
        }
    }

    async fn ready_for_handout(
        &self,
        key: &K,
        sub: &Arc<SubPool<F::Object>>,
        p: &Arc<PooledObject<F::Object>>,
    ) -> Prepared<F::Object> {
        let Some(mut object) = p.take_object() else {
            self.destroy_in(key, sub, p, DestroyMode::Normal, DestroyReason::Normal).await;
            return Prepared::Retry;
        };
        if let Err(error) = self.factory.activate(key, &mut object).await {
            debug!(id = p.id(), ?key, %error, "activation failed; destroying");
            self.destroy_with_object_in(
                key,
                sub,
                p,
                object,
                DestroyMode::Normal,
                DestroyReason::BorrowValidation,
            )
            .await;
            return Prepared::Retry;
        }
        if self.config.test_on_borrow && !self.factory.validate(key, &mut object).await {
            debug!(id = p.id(), ?key, "borrow validation failed; destroying");
            self.destroy_with_object_in(
                key,
                sub,
                p,
                object,
                DestroyMode::Normal,
                DestroyReason::BorrowValidation,
            )
            .await;
            return Prepared::Retry;
        }
        Prepared::Ready(object)
    }

    async fn put_back_inner(
        &self,
        key: &K,
        p: Arc<PooledObject<F::Object>>,
        mut object: F::Object,
    ) -> Result<(), F::Error> {
        let now = self.now();
        let active_for = Duration::from_nanos(p.active_nanos(now));
        let sub = self.subpool(key);

        if !p.start_returning() {
            self.factory.destroy(key, object, DestroyMode::Abandoned).await;
            return Err(Error::illegal(
                "returned object is no longer checked out from this pool",
            ));
        }

        if self.config.test_on_return {
            p.begin_return_validation();
            let ok = self.factory.validate(key, &mut object).await;
            p.end_return_validation();
            if !ok {
                debug!(id = p.id(), ?key, "return validation failed; destroying");
                self.destroy_with_object_in(
                    key,
                    &sub,
                    &p,
                    object,
                    DestroyMode::Normal,
                    DestroyReason::Normal,
                )
                .await;
                self.stats.on_returned(active_for);
                return Ok(());
            }
        }

        if let Err(error) = self.factory.passivate(key, &mut object).await {
            debug!(id = p.id(), ?key, %error, "passivation failed; destroying");
            self.destroy_with_object_in(
                key,
                &sub,
                &p,
                object,
                DestroyMode::Normal,
                DestroyReason::Normal,
            )
            .await;
            self.stats.on_returned(active_for);
            return Ok(());
        }

        p.put_object(object);
        if !p.deallocate(now) {
            if let Some(object) = p.take_object() {
                self.factory.destroy(key, object, DestroyMode::Normal).await;
            }
            self.stats.on_returned(active_for);
            return Ok(());
        }

        let surplus = {
            let mut shared = sub.shared.lock();
            if self.is_closed() {
                Some(Arc::clone(&p))
            } else {
                match shared.waiters.offer(Arc::clone(&p)) {
                    None => None,
                    Some(back) => {
                        let max_idle_reached = self
                            .config
                            .max_idle_per_key
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
            self.destroy_in(key, &sub, &p, DestroyMode::Normal, DestroyReason::Normal)
                .await;
        }
        self.stats.on_returned(active_for);
        Ok(())
    }

    fn salvage(
        inner: &Arc<Self>,
        key: &K,
        sub: &Arc<SubPool<F::Object>>,
        p: Arc<PooledObject<F::Object>>,
    ) {
        {
            let mut shared = sub.shared.lock();
            if !inner.is_closed() {
                inner.offer_or_idle_locked(&mut shared, p, true);
                return;
            }
        }
        if let Some(claim) = Self::claim_destroy_in(sub, &p) {
            if let Some(object) = claim.object {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let inner = Arc::clone(inner);
                        let key = key.clone();
                        handle.spawn(async move {
                            inner.factory.destroy(&key, object, DestroyMode::Normal).await;
                        });
                    }
                    Err(_) => drop(object),
                }
            }
            inner.finish_destroy_in(key, sub, DestroyReason::Normal);
        }
    }

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

    fn claim_destroy_in(
        sub: &SubPool<F::Object>,
        p: &Arc<PooledObject<F::Object>>,
    ) -> Option<DestroyClaim<F::Object>> {
        let previous = p.invalidate();
        if previous == PoolState::Invalid {
            return None;
        }
        {
            let mut shared = sub.shared.lock();
            shared.idle.remove(p.id());
            shared.all.remove(&p.id());
        }
        Some(DestroyClaim {
            object: p.take_object(),
        })
    }

    fn finish_destroy_in(&self, key: &K, sub: &SubPool<F::Object>, reason: DestroyReason) {
        self.stats.on_destroyed(reason);
        self.global_gate.release();
        sub.gate.release();
        self.wake_after_destroy(key);
    }

    async fn destroy_in(
        &self,
        key: &K,
        sub: &SubPool<F::Object>,
        p: &Arc<PooledObject<F::Object>>,
        mode: DestroyMode,
        reason: DestroyReason,
    ) -> bool {
        let Some(claim) = Self::claim_destroy_in(sub, p) else {
            return false;
        };
        if let Some(object) = claim.object {
            self.factory.destroy(key, object, mode).await;
        }
        trace!(id = p.id(), ?key, ?reason, "destroyed pooled object");
        self.finish_destroy_in(key, sub, reason);
        true
    }

    /// Returns whether this call performed the live claim; `false` means
    /// the abandonment sweeper had already reclaimed the wrapper and only
    /// the resource itself remained to tear down.
    async fn destroy_with_object_in(
        &self,
        key: &K,
        sub: &SubPool<F::Object>,
        p: &Arc<PooledObject<F::Object>>,
        object: F::Object,
        mode: DestroyMode,
        reason: DestroyReason,
    ) -> bool {
        match Self::claim_destroy_in(sub, p) {
            Some(claim) => {
                debug_assert!(claim.object.is_none(), "caller holds the object");
                self.factory.destroy(key, object, mode).await;
                self.finish_destroy_in(key, sub, reason);
                true
            }
            None => {
                self.factory.destroy(key, object, mode).await;
                false
            }
        }
    }

    /// Create one idle object under `key`; both gates must already be
    /// acquired.
    async fn create_idle_in(
        &self,
        key: &K,
        sub: &Arc<SubPool<F::Object>>,
    ) -> Result<(), F::Error> {
        let mut object = match self.factory.create(key).await {
            Ok(object) => object,
            Err(error) => {
                self.release_capacity(key, sub);
                return Err(Error::Factory(error));
            }
        };
        if let Err(error) = self.factory.passivate(key, &mut object).await {
            debug!(?key, %error, "passivation of pre-created object failed");
            self.release_capacity(key, sub);
            return Err(Error::Factory(error));
        }
        let now = self.now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let p = Arc::new(PooledObject::new(id, object, now));
        self.stats.on_created();
        let mut shared = sub.shared.lock();
        shared.all.insert(id, Arc::clone(&p));
        self.offer_or_idle_locked(&mut shared, p, false);
        Ok(())
    }

    async fn ensure_min_idle_in(
        &self,
        key: &K,
        sub: &Arc<SubPool<F::Object>>,
    ) -> Result<(), F::Error> {
        let min_idle = self.config.min_idle_per_key;
        loop {
            if self.is_closed() {
                return Ok(());
            }
            {
                let shared = sub.shared.lock();
                if shared.idle.len() >= min_idle {
                    return Ok(());
                }
            }
            if !sub.gate.try_acquire() {
                return Ok(());
            }
            if !self.global_gate.try_acquire() {
                sub.gate.release();
                return Ok(());
            }
            self.create_idle_in(key, sub).await?;
        }
    }

    fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig {
            min_evictable_idle_time: self.config.min_evictable_idle_time,
            soft_min_evictable_idle_time: self.config.soft_min_evictable_idle_time,
            min_idle: self.config.min_idle_per_key,
        }
    }

    fn tests_per_run(&self, idle_count: usize) -> usize {
        let n = self.config.num_tests_per_eviction_run;
        if n >= 0 {
            (n as usize).min(idle_count)
        } else {
            idle_count.div_ceil(n.unsigned_abs() as usize)
        }
    }

    /// One eviction sweep, round-robin across keys starting after the key
    /// where the previous sweep stopped.
    async fn evict_once(&self) {
        let now = self.now();
        let keys: Vec<K> = self.pools.iter().map(|e| e.key().clone()).collect();
        if keys.is_empty() {
            return;
        }
        let start = {
            let cursor = self.evict_key_cursor.lock();
            match cursor.as_ref().and_then(|c| keys.iter().position(|k| k == c)) {
                Some(position) => (position + 1) % keys.len(),
                None => 0,
            }
        };
        let total_idle: usize = self
            .pools
            .iter()
            .map(|e| e.value().shared.lock().idle.len())
            .sum();
        let mut budget = self.tests_per_run(total_idle);
        let eviction_config = self.eviction_config();

        for offset in 0..keys.len() {
            if budget == 0 {
                break;
            }
            let key = &keys[(start + offset) % keys.len()];
            let Some(sub) = self.existing_subpool(key) else {
                continue;
            };
            let (candidates, idle_count) = {
                let mut guard = sub.shared.lock();
                let shared = &mut *guard;
                let idle_count = shared.idle.len();
                let batch =
                    shared
                        .idle
                        .eviction_batch(&mut shared.evict_cursor, budget, self.config.lifo);
                (batch, idle_count)
            };
            budget = budget.saturating_sub(candidates.len());
            *self.evict_key_cursor.lock() = Some(key.clone());

            for p in candidates {
                if !p.start_eviction_test() {
                    continue;
                }
                if self.config.test_while_idle && p.begin_idle_validation() {
                    let valid = match p.take_object() {
                        Some(mut object) => {
                            let valid = self.factory.validate(key, &mut object).await;
                            p.put_object(object);
                            valid
                        }
                        None => false,
                    };
                    if !valid {
                        debug!(id = p.id(), ?key, "idle validation failed; evicting");
                        self.destroy_in(key, &sub, &p, DestroyMode::Normal, DestroyReason::Evictor)
                            .await;
                        continue;
                    }
                }
                if self.policy.evict(&eviction_config, &p, idle_count, now) {
                    self.destroy_in(key, &sub, &p, DestroyMode::Normal, DestroyReason::Evictor)
                        .await;
                    continue;
                }
                match p.end_eviction_test() {
                    EndEvictionTest::InPlace => {}
                    EndEvictionTest::ReturnToHead => {
                        let mut shared = sub.shared.lock();
                        self.offer_or_idle_locked(&mut shared, Arc::clone(&p), true);
                    }
                    EndEvictionTest::Lost => {}
                }
            }
        }
    }

    fn near_saturation(&self) -> bool {
        let Some(max_total) = self.global_gate.bound() else {
            return false;
        };
        let (active, idle) = {
            let mut active = 0;
            let mut idle = 0;
            for entry in self.pools.iter() {
                let shared = entry.value().shared.lock();
                active += shared.num_active();
                idle += shared.idle.len();
            }
            (active, idle)
        };
        idle < 2 && active > max_total.saturating_sub(3)
    }

    async fn remove_abandoned(&self) {
        let timeout = self.config.abandoned.timeout;
        let now = self.now();
        let threshold = now.saturating_sub(timeout.as_nanos() as u64);
        let subs: Vec<(K, Arc<SubPool<F::Object>>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (key, sub) in subs {
            let candidates: Vec<Arc<PooledObject<F::Object>>> = {
                let shared = sub.shared.lock();
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
                        warn!(id = p.id(), ?key, borrowed_at = %trace, "reclaiming abandoned object");
                    }
                    _ => {
                        debug!(id = p.id(), ?key, "reclaiming abandoned object");
                    }
                }
                if let Some(claim) = Self::claim_destroy_in(&sub, &p) {
                    if let Some(object) = claim.object {
                        self.factory.destroy(&key, object, DestroyMode::Abandoned).await;
                    }
                    self.finish_destroy_in(&key, &sub, DestroyReason::Abandonment);
                }
            }
        }
    }

    async fn run_maintenance(&self) {
        self.evict_once().await;
        if self.config.abandoned.remove_on_maintenance {
            self.remove_abandoned().await;
        }
        if self.config.min_idle_per_key > 0 {
            let subs: Vec<(K, Arc<SubPool<F::Object>>)> = self
                .pools
                .iter()
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect();
            for (key, sub) in subs {
                if let Err(error) = self.ensure_min_idle_in(&key, &sub).await {
                    debug!(?key, %error, "min-idle refill stopped");
                }
            }
        }
    }
}
