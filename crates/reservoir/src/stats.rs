//! Pool statistics
//!
//! Cumulative counters are atomics updated outside the pool lock and only
//! ever increase. Timing means are computed over a sliding window of the
//! last 100 samples; the borrow-wait maximum is tracked over the pool's
//! whole lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

const WINDOW: usize = 100;

/// Why an object was destroyed, for the by-cause counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestroyReason {
    /// Invalidate, surplus on return, passivation failure, clear, close.
    Normal,
    /// Evictor policy or idle-validation failure.
    Evictor,
    /// Validation or activation failure on the borrow path.
    BorrowValidation,
    /// Reclaimed by the abandonment sweeper.
    Abandonment,
}

struct TimingWindow {
    samples: std::collections::VecDeque<Duration>,
    max_seen: Duration,
}

impl TimingWindow {
    fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(WINDOW),
            max_seen: Duration::ZERO,
        }
    }

    fn record(&mut self, sample: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if sample > self.max_seen {
            self.max_seen = sample;
        }
    }

    fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }
}

pub(crate) struct StatsCore {
    created: AtomicU64,
    destroyed: AtomicU64,
    destroyed_by_evictor: AtomicU64,
    destroyed_by_borrow_validation: AtomicU64,
    destroyed_by_abandonment: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    borrow_waits: Mutex<TimingWindow>,
    active_times: Mutex<TimingWindow>,
    idle_times: Mutex<TimingWindow>,
}

impl StatsCore {
    pub(crate) fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            destroyed_by_evictor: AtomicU64::new(0),
            destroyed_by_borrow_validation: AtomicU64::new(0),
            destroyed_by_abandonment: AtomicU64::new(0),
            borrowed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            borrow_waits: Mutex::new(TimingWindow::new()),
            active_times: Mutex::new(TimingWindow::new()),
            idle_times: Mutex::new(TimingWindow::new()),
        }
    }

    pub(crate) fn on_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_destroyed(&self, reason: DestroyReason) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        let by_cause = match reason {
            DestroyReason::Normal => return,
            DestroyReason::Evictor => &self.destroyed_by_evictor,
            DestroyReason::BorrowValidation => &self.destroyed_by_borrow_validation,
            DestroyReason::Abandonment => &self.destroyed_by_abandonment,
        };
        by_cause.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_borrowed(&self, waited: Duration, idle_for: Option<Duration>) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.borrow_waits.lock().record(waited);
        if let Some(idle_for) = idle_for {
            self.idle_times.lock().record(idle_for);
        }
    }

    pub(crate) fn on_returned(&self, active_for: Duration) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.active_times.lock().record(active_for);
    }

    pub(crate) fn snapshot(&self, num_active: usize, num_idle: usize, num_waiters: usize) -> PoolStats {
        let borrow_waits = self.borrow_waits.lock();
        let mean_borrow_wait = borrow_waits.mean();
        let max_borrow_wait = borrow_waits.max_seen;
        drop(borrow_waits);
        PoolStats {
            num_active,
            num_idle,
            num_waiters,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            destroyed_by_evictor: self.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_by_borrow_validation: self
                .destroyed_by_borrow_validation
                .load(Ordering::Relaxed),
            destroyed_by_abandonment: self.destroyed_by_abandonment.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            mean_borrow_wait,
            max_borrow_wait,
            mean_active_time: self.active_times.lock().mean(),
            mean_idle_time: self.idle_times.lock().mean(),
        }
    }
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects currently checked out.
    pub num_active: usize,
    /// Objects currently idle.
    pub num_idle: usize,
    /// Borrowers currently parked.
    pub num_waiters: usize,
    /// Objects ever created.
    pub created: u64,
    /// Objects ever destroyed.
    pub destroyed: u64,
    /// Destroyed by the evictor (policy or idle validation).
    pub destroyed_by_evictor: u64,
    /// Destroyed by borrow-path validation or activation failure.
    pub destroyed_by_borrow_validation: u64,
    /// Destroyed by the abandonment sweeper.
    pub destroyed_by_abandonment: u64,
    /// Successful borrows.
    pub borrowed: u64,
    /// Successful returns.
    pub returned: u64,
    /// Mean borrow wait over the last 100 borrows.
    pub mean_borrow_wait: Duration,
    /// Longest borrow wait ever observed.
    pub max_borrow_wait: Duration,
    /// Mean checked-out duration over the last 100 returns.
    pub mean_active_time: Duration,
    /// Mean idle duration of borrowed objects over the last 100 borrows.
    pub mean_idle_time: Duration,
}
