//! Per-instance control block
//!
//! Every live object in a pool is owned by exactly one `PooledObject<T>`.
//! The wrapper's state word is the single source of truth for concurrent
//! coordination: all lifecycle transitions are single-word compare-and-swap,
//! so the pool never takes a per-object lock. The resource itself sits in
//! `slot` and is moved out into the borrower's guard while checked out; the
//! state machine guarantees at most one party touches the slot at a time.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

/// Lifecycle state of a pooled object.
///
/// `Invalid` is terminal. The `*ReturnToHead` states record that a borrower
/// popped the object out of the idle store while the evictor was testing it;
/// when the test completes the evictor re-offers the object at the borrow
/// end of the store so the racing borrower's successor finds it promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// In the idle store, available for borrowing.
    Idle = 0,
    /// Checked out by a borrower.
    Allocated = 1,
    /// Return in progress; owned by the returning task.
    Returning = 2,
    /// Return-path validation (`test_on_return`) in progress.
    Validation = 3,
    /// Evictor owns the object for a policy test.
    Eviction = 4,
    /// A borrow raced the eviction test; re-offer at the borrow end.
    EvictionReturnToHead = 5,
    /// Evictor is running `test_while_idle` validation.
    ValidationPreEviction = 6,
    /// A borrow raced the idle validation; re-offer at the borrow end.
    ValidationReturnToHead = 7,
    /// Reclaimed by the abandonment sweeper; no longer tracked.
    Abandoned = 8,
    /// Destroyed or being destroyed. Terminal.
    Invalid = 9,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Allocated,
            2 => Self::Returning,
            3 => Self::Validation,
            4 => Self::Eviction,
            5 => Self::EvictionReturnToHead,
            6 => Self::ValidationPreEviction,
            7 => Self::ValidationReturnToHead,
            8 => Self::Abandoned,
            _ => Self::Invalid,
        }
    }
}

/// Outcome of finishing an eviction test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndEvictionTest {
    /// The object is still in the idle store; nothing to do.
    InPlace,
    /// A borrow raced the test; the caller must re-insert the object at the
    /// borrow end of the idle store.
    ReturnToHead,
    /// The object left the eviction states by another path.
    Lost,
}

/// How an object is being destroyed, passed through to the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Ordinary destruction: eviction, validation failure, invalidate,
    /// surplus on return, pool close.
    Normal,
    /// The object was reclaimed as abandoned; the factory may skip work
    /// that assumes a cooperative owner (e.g. an orderly connection close).
    Abandoned,
}

/// The pool's per-instance control block.
///
/// Timestamps are nanosecond offsets from the owning pool's epoch, taken
/// from a monotonic clock.
pub struct PooledObject<T> {
    id: u64,
    state: AtomicU8,
    created_at: u64,
    last_borrow: AtomicU64,
    last_return: AtomicU64,
    last_use: AtomicU64,
    borrowed_count: AtomicU64,
    slot: Mutex<Option<T>>,
    borrow_trace: Mutex<Option<String>>,
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: u64, object: T, now: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(PoolState::Idle as u8),
            created_at: now,
            last_borrow: AtomicU64::new(now),
            last_return: AtomicU64::new(now),
            last_use: AtomicU64::new(now),
            borrowed_count: AtomicU64::new(0),
            slot: Mutex::new(Some(object)),
            borrow_trace: Mutex::new(None),
        }
    }

    /// Stable identity of this wrapper for its lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the object for a borrower.
    ///
    /// Succeeds only from `Idle`. Observing an eviction-test state instead
    /// marks the object for re-offer at the borrow end and fails, so the
    /// borrower moves on while the evictor finishes.
    pub(crate) fn try_allocate(&self, now: u64) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let target = match PoolState::from_u8(current) {
                PoolState::Idle => PoolState::Allocated,
                PoolState::Eviction => PoolState::EvictionReturnToHead,
                PoolState::ValidationPreEviction => PoolState::ValidationReturnToHead,
                _ => return false,
            };
            if self
                .state
                .compare_exchange(current, target as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if target == PoolState::Allocated {
                    self.last_borrow.store(now, Ordering::Release);
                    self.last_use.store(now, Ordering::Release);
                    self.borrowed_count.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                return false;
            }
        }
    }

    /// Begin a return: `Allocated -> Returning`.
    pub(crate) fn start_returning(&self) -> bool {
        self.transition(PoolState::Allocated, PoolState::Returning)
    }

    /// Enter return-path validation: `Returning -> Validation`.
    pub(crate) fn begin_return_validation(&self) -> bool {
        self.transition(PoolState::Returning, PoolState::Validation)
    }

    /// Leave return-path validation: `Validation -> Returning`.
    pub(crate) fn end_return_validation(&self) -> bool {
        self.transition(PoolState::Validation, PoolState::Returning)
    }

    /// Complete a return: `Returning -> Idle`, stamping the return time.
    pub(crate) fn deallocate(&self, now: u64) -> bool {
        if self.transition(PoolState::Returning, PoolState::Idle)
            || self.transition(PoolState::Allocated, PoolState::Idle)
        {
            self.last_return.store(now, Ordering::Release);
            return true;
        }
        false
    }

    /// Claim the object for an eviction test: `Idle -> Eviction`.
    ///
    /// The object stays in the idle store during the test; a racing borrow
    /// that pops it will fail `try_allocate` and leave a return-to-head mark.
    pub(crate) fn start_eviction_test(&self) -> bool {
        self.transition(PoolState::Idle, PoolState::Eviction)
    }

    /// Enter idle validation under an eviction test:
    /// `Eviction -> ValidationPreEviction`.
    pub(crate) fn begin_idle_validation(&self) -> bool {
        self.transition(PoolState::Eviction, PoolState::ValidationPreEviction)
    }

    /// Finish an eviction test, restoring `Idle`.
    pub(crate) fn end_eviction_test(&self) -> EndEvictionTest {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let outcome = match PoolState::from_u8(current) {
                PoolState::Eviction | PoolState::ValidationPreEviction => EndEvictionTest::InPlace,
                PoolState::EvictionReturnToHead | PoolState::ValidationReturnToHead => {
                    EndEvictionTest::ReturnToHead
                }
                _ => return EndEvictionTest::Lost,
            };
            if self
                .state
                .compare_exchange(
                    current,
                    PoolState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return outcome;
            }
        }
    }

    /// Reclassify a long-unused borrowed object: `Allocated -> Abandoned`.
    pub(crate) fn mark_abandoned(&self) -> bool {
        self.transition(PoolState::Allocated, PoolState::Abandoned)
    }

    /// Unconditionally enter the terminal state, returning the previous one.
    ///
    /// Exactly one caller observes a non-`Invalid` previous state; that
    /// caller owns destruction of the object.
    pub(crate) fn invalidate(&self) -> PoolState {
        PoolState::from_u8(self.state.swap(PoolState::Invalid as u8, Ordering::AcqRel))
    }

    /// Take the resource out of the wrapper.
    pub(crate) fn take_object(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Put the resource back into the wrapper.
    pub(crate) fn put_object(&self, object: T) {
        *self.slot.lock() = Some(object);
    }

    /// Nanoseconds since the pool epoch at which this wrapper was created.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// How many times this object has been borrowed.
    #[must_use]
    pub fn borrowed_count(&self) -> u64 {
        self.borrowed_count.load(Ordering::Relaxed)
    }

    /// Nanoseconds this object has been idle, relative to `now`.
    #[must_use]
    pub fn idle_nanos(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_return.load(Ordering::Acquire))
    }

    /// Nanoseconds since the current (or latest) borrow started.
    #[must_use]
    pub fn active_nanos(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_borrow.load(Ordering::Acquire))
    }

    /// Record that the borrower used the object.
    pub(crate) fn touch(&self, now: u64) {
        self.last_use.store(now, Ordering::Release);
    }

    /// Most recent of the borrow and use stamps; the abandonment clock.
    pub(crate) fn last_used(&self) -> u64 {
        self.last_use
            .load(Ordering::Acquire)
            .max(self.last_borrow.load(Ordering::Acquire))
    }

    pub(crate) fn set_borrow_trace(&self, trace: Option<String>) {
        *self.borrow_trace.lock() = trace;
    }

    pub(crate) fn take_borrow_trace(&self) -> Option<String> {
        self.borrow_trace.lock().take()
    }
}

impl<T> std::fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("borrowed_count", &self.borrowed_count())
            .finish()
    }
}
