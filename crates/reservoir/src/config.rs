//! Pool configuration
//!
//! `PoolConfig` covers the single-keyspace [`Pool`](crate::pool::Pool);
//! `KeyedPoolConfig` adds the per-key bounds used by
//! [`KeyedPool`](crate::keyed::KeyedPool). Unbounded / disabled settings are
//! encoded as `None`.

use std::time::Duration;

use crate::error::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Abandoned-object tracking configuration.
///
/// Disabled entirely by default. When enabled, borrowed objects whose last
/// use is older than `timeout` are reclaimed by the sweeper.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AbandonedConfig {
    /// Sweep for abandoned objects inside `borrow` when the pool is close
    /// to saturation.
    pub remove_on_borrow: bool,
    /// Sweep for abandoned objects on every evictor run.
    pub remove_on_maintenance: bool,
    /// Age past which a borrowed object counts as abandoned.
    pub timeout: Duration,
    /// Capture the borrower's call stack at borrow time and log it when the
    /// object is reclaimed.
    pub log_abandoned: bool,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            remove_on_borrow: false,
            remove_on_maintenance: false,
            timeout: Duration::from_secs(300),
            log_abandoned: false,
        }
    }
}

impl AbandonedConfig {
    /// Whether any sweep trigger is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.remove_on_borrow || self.remove_on_maintenance
    }
}

/// Configuration for a single-keyspace pool.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Maximum live objects (idle + borrowed). `None` = unbounded.
    pub max_total: Option<usize>,
    /// Maximum idle objects kept on return; excess is destroyed.
    /// `None` = unbounded.
    pub max_idle: Option<usize>,
    /// Minimum idle objects the evictor refills to.
    pub min_idle: usize,
    /// How long a blocking borrow waits. `None` = wait forever.
    pub max_wait: Option<Duration>,
    /// Park borrowers when the pool is exhausted instead of failing.
    pub block_when_exhausted: bool,
    /// Serve parked borrowers in strict arrival order.
    pub fair: bool,
    /// Take the most recently returned idle object first.
    pub lifo: bool,
    /// Validate freshly created objects before handing them out.
    pub test_on_create: bool,
    /// Validate idle objects on borrow.
    pub test_on_borrow: bool,
    /// Validate objects on return.
    pub test_on_return: bool,
    /// Validate idle objects during eviction runs.
    pub test_while_idle: bool,
    /// Interval between evictor runs. `None` disables the evictor.
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle objects examined per evictor run. Negative `n` means a
    /// `ceil(idle / |n|)` share of the idle population.
    pub num_tests_per_eviction_run: i64,
    /// Idle age past which an object is always evictable. `None` disables.
    pub min_evictable_idle_time: Option<Duration>,
    /// Idle age past which an object is evictable while more than
    /// `min_idle` objects are idle. `None` disables.
    pub soft_min_evictable_idle_time: Option<Duration>,
    /// Abandoned-object tracking.
    pub abandoned: AbandonedConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: Some(8),
            max_idle: Some(8),
            min_idle: 0,
            max_wait: None,
            block_when_exhausted: true,
            fair: false,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle_time: None,
            abandoned: AbandonedConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate<E>(&self) -> Result<(), Error<E>> {
        if self.max_total == Some(0) {
            return Err(Error::configuration("max_total must be greater than 0"));
        }
        if let Some(max_idle) = self.max_idle {
            if self.min_idle > max_idle {
                return Err(Error::configuration(format!(
                    "min_idle ({}) must not exceed max_idle ({max_idle})",
                    self.min_idle
                )));
            }
        }
        if let Some(max_total) = self.max_total {
            if self.min_idle > max_total {
                return Err(Error::configuration(format!(
                    "min_idle ({}) must not exceed max_total ({max_total})",
                    self.min_idle
                )));
            }
        }
        if self.time_between_eviction_runs == Some(Duration::ZERO) {
            return Err(Error::configuration(
                "time_between_eviction_runs must be greater than zero (use None to disable)",
            ));
        }
        if self.abandoned.enabled() && self.abandoned.timeout.is_zero() {
            return Err(Error::configuration(
                "abandoned.timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for a keyed pool.
///
/// Per-key bounds replace `max_idle`/`min_idle`; `max_total` bounds the sum
/// of all sub-pools.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyedPoolConfig {
    /// Maximum live objects across all keys. `None` = unbounded.
    pub max_total: Option<usize>,
    /// Maximum live objects per key. `None` = unbounded.
    pub max_total_per_key: Option<usize>,
    /// Maximum idle objects kept per key.
    pub max_idle_per_key: Option<usize>,
    /// Minimum idle objects the evictor refills each key to.
    pub min_idle_per_key: usize,
    /// How long a blocking borrow waits. `None` = wait forever.
    pub max_wait: Option<Duration>,
    /// Park borrowers when a key is exhausted instead of failing.
    pub block_when_exhausted: bool,
    /// Serve parked borrowers in strict arrival order (per key).
    pub fair: bool,
    /// Take the most recently returned idle object first.
    pub lifo: bool,
    /// Validate freshly created objects before handing them out.
    pub test_on_create: bool,
    /// Validate idle objects on borrow.
    pub test_on_borrow: bool,
    /// Validate objects on return.
    pub test_on_return: bool,
    /// Validate idle objects during eviction runs.
    pub test_while_idle: bool,
    /// Interval between evictor runs. `None` disables the evictor.
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle objects examined per evictor run, across all keys.
    pub num_tests_per_eviction_run: i64,
    /// Idle age past which an object is always evictable. `None` disables.
    pub min_evictable_idle_time: Option<Duration>,
    /// Idle age past which an object is evictable while more than
    /// `min_idle_per_key` objects are idle under its key. `None` disables.
    pub soft_min_evictable_idle_time: Option<Duration>,
    /// Abandoned-object tracking.
    pub abandoned: AbandonedConfig,
}

impl Default for KeyedPoolConfig {
    fn default() -> Self {
        Self {
            max_total: Some(8),
            max_total_per_key: Some(8),
            max_idle_per_key: Some(8),
            min_idle_per_key: 0,
            max_wait: None,
            block_when_exhausted: true,
            fair: false,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle_time: None,
            abandoned: AbandonedConfig::default(),
        }
    }
}

impl KeyedPoolConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate<E>(&self) -> Result<(), Error<E>> {
        if self.max_total == Some(0) {
            return Err(Error::configuration("max_total must be greater than 0"));
        }
        if self.max_total_per_key == Some(0) {
            return Err(Error::configuration(
                "max_total_per_key must be greater than 0",
            ));
        }
        if let Some(max_idle) = self.max_idle_per_key {
            if self.min_idle_per_key > max_idle {
                return Err(Error::configuration(format!(
                    "min_idle_per_key ({}) must not exceed max_idle_per_key ({max_idle})",
                    self.min_idle_per_key
                )));
            }
        }
        if self.time_between_eviction_runs == Some(Duration::ZERO) {
            return Err(Error::configuration(
                "time_between_eviction_runs must be greater than zero (use None to disable)",
            ));
        }
        if self.abandoned.enabled() && self.abandoned.timeout.is_zero() {
            return Err(Error::configuration(
                "abandoned.timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The sub-pool view of this configuration: per-key bounds mapped onto
    /// the single-pool fields. The global `max_total` is enforced separately
    /// by the shared gate.
    pub(crate) fn per_key_view(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_total_per_key,
            max_idle: self.max_idle_per_key,
            min_idle: self.min_idle_per_key,
            max_wait: self.max_wait,
            block_when_exhausted: self.block_when_exhausted,
            fair: self.fair,
            lifo: self.lifo,
            test_on_create: self.test_on_create,
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
            time_between_eviction_runs: self.time_between_eviction_runs,
            num_tests_per_eviction_run: self.num_tests_per_eviction_run,
            min_evictable_idle_time: self.min_evictable_idle_time,
            soft_min_evictable_idle_time: self.soft_min_evictable_idle_time,
            abandoned: self.abandoned.clone(),
        }
    }
}
