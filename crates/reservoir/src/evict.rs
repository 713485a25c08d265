//! Eviction policy
//!
//! The evictor asks a policy whether each visited idle object should be
//! destroyed. Policies are pure predicates over the object's idle age, the
//! idle population and the thresholds below; custom policies plug in via
//! the pool builder.

use std::sync::Arc;
use std::time::Duration;

use crate::object::PooledObject;

/// Threshold view handed to eviction policies.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Idle age past which an object is always evictable. `None` disables.
    pub min_evictable_idle_time: Option<Duration>,
    /// Idle age past which an object is evictable while the idle population
    /// exceeds `min_idle`. `None` disables.
    pub soft_min_evictable_idle_time: Option<Duration>,
    /// Idle floor protected from soft eviction.
    pub min_idle: usize,
}

/// Decides whether an idle object should be destroyed.
pub trait EvictionPolicy<T>: Send + Sync {
    /// `true` destroys `object`. `idle_count` is the idle population of the
    /// (sub-)pool at the start of the sweep; `now` is nanoseconds since the
    /// pool epoch.
    fn evict(
        &self,
        config: &EvictionConfig,
        object: &PooledObject<T>,
        idle_count: usize,
        now: u64,
    ) -> bool;
}

/// The stock policy: evict past `min_evictable_idle_time`, or past
/// `soft_min_evictable_idle_time` while more than `min_idle` objects sit
/// idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvictionPolicy;

impl<T> EvictionPolicy<T> for DefaultEvictionPolicy {
    fn evict(
        &self,
        config: &EvictionConfig,
        object: &PooledObject<T>,
        idle_count: usize,
        now: u64,
    ) -> bool {
        let idle_nanos = u128::from(object.idle_nanos(now));
        if let Some(min) = config.min_evictable_idle_time {
            if idle_nanos > min.as_nanos() {
                return true;
            }
        }
        if let Some(soft_min) = config.soft_min_evictable_idle_time {
            if idle_count > config.min_idle && idle_nanos > soft_min.as_nanos() {
                return true;
            }
        }
        false
    }
}

/// Shared handle to a policy, defaulting to [`DefaultEvictionPolicy`].
pub(crate) fn default_policy<T>() -> Arc<dyn EvictionPolicy<T>> {
    Arc::new(DefaultEvictionPolicy)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Created and returned at t=0; idle age is whatever `now` says.
    fn returned_at_zero() -> PooledObject<u32> {
        PooledObject::new(1, 0, 0)
    }

    fn config(
        min: Option<Duration>,
        soft: Option<Duration>,
        min_idle: usize,
    ) -> EvictionConfig {
        EvictionConfig {
            min_evictable_idle_time: min,
            soft_min_evictable_idle_time: soft,
            min_idle,
        }
    }

    #[test]
    fn hard_threshold_evicts_old_objects() {
        let policy = DefaultEvictionPolicy;
        let object = returned_at_zero();
        let cfg = config(Some(Duration::from_secs(1)), None, 0);

        let now = Duration::from_millis(500).as_nanos() as u64;
        assert!(!policy.evict(&cfg, &object, 1, now));

        let now = Duration::from_secs(2).as_nanos() as u64;
        assert!(policy.evict(&cfg, &object, 1, now));
    }

    #[test]
    fn disabled_thresholds_never_evict() {
        let policy = DefaultEvictionPolicy;
        let object = returned_at_zero();
        let cfg = config(None, None, 0);
        let now = Duration::from_secs(3600).as_nanos() as u64;
        assert!(!policy.evict(&cfg, &object, 100, now));
    }

    #[test]
    fn soft_threshold_respects_min_idle() {
        let policy = DefaultEvictionPolicy;
        let object = returned_at_zero();
        let cfg = config(None, Some(Duration::from_secs(1)), 2);
        let now = Duration::from_secs(5).as_nanos() as u64;

        // Idle floor not exceeded: keep.
        assert!(!policy.evict(&cfg, &object, 2, now));
        // More idle than the floor: evict.
        assert!(policy.evict(&cfg, &object, 3, now));
    }

    #[test]
    fn hard_threshold_wins_over_idle_floor() {
        let policy = DefaultEvictionPolicy;
        let object = returned_at_zero();
        let cfg = config(Some(Duration::from_secs(1)), Some(Duration::from_secs(10)), 5);
        let now = Duration::from_secs(2).as_nanos() as u64;
        // Below the floor, but past the hard threshold.
        assert!(policy.evict(&cfg, &object, 1, now));
    }
}
