//! Background maintenance task: periodic eviction, abandonment sweeps, and
//! min-idle refill, driven by the virtual clock.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reservoir::{
    AbandonedConfig, Error, Factory, KeyedFactory, KeyedPool, KeyedPoolConfig, Pool, PoolConfig,
};

struct Numbers(AtomicU32);

impl Numbers {
    fn new() -> Self {
        Self(AtomicU32::new(0))
    }
}

impl Factory for Numbers {
    type Object = u32;
    type Error = Infallible;

    async fn create(&self) -> Result<u32, Infallible> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

impl KeyedFactory<&'static str> for Numbers {
    type Object = u32;
    type Error = Infallible;

    async fn create(&self, _key: &&'static str) -> Result<u32, Infallible> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test(start_paused = true)]
async fn background_evictor_reaps_stale_idle() {
    let pool = Pool::new(
        Numbers::new(),
        PoolConfig {
            max_total: Some(8),
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: Some(Duration::from_millis(50)),
            num_tests_per_eviction_run: 3,
            ..Default::default()
        },
    )
    .unwrap();

    let guards = [
        pool.borrow().await.unwrap(),
        pool.borrow().await.unwrap(),
        pool.borrow().await.unwrap(),
    ];
    for guard in guards {
        pool.put_back(guard).await.unwrap();
    }
    assert_eq!(pool.num_idle(), 3);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.num_idle(), 0);
    assert_eq!(pool.stats().destroyed_by_evictor, 3);
}

#[tokio::test(start_paused = true)]
async fn maintenance_refills_min_idle() {
    let pool = Pool::new(
        Numbers::new(),
        PoolConfig {
            max_total: Some(8),
            min_idle: 2,
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            // Keep the evictor itself quiet so only the refill acts.
            min_evictable_idle_time: None,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(pool.num_idle(), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.num_idle(), 2, "first tick refills to min_idle");

    pool.clear().await;
    assert_eq!(pool.num_idle(), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.num_idle(), 2, "refilled again after clear");
}

#[tokio::test(start_paused = true)]
async fn maintenance_sweeps_abandoned_borrows() {
    let pool = Pool::new(
        Numbers::new(),
        PoolConfig {
            max_total: Some(4),
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: None,
            abandoned: AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();

    let stale = pool.borrow().await.unwrap();
    assert_eq!(pool.num_active(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.num_active(), 0, "sweeper reclaimed the stale borrow");
    assert_eq!(pool.stats().destroyed_by_abandonment, 1);

    match pool.put_back(stale).await {
        Err(Error::IllegalState { .. }) => {}
        other => panic!("expected IllegalState, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn touch_defers_abandonment() {
    let pool = Pool::new(
        Numbers::new(),
        PoolConfig {
            max_total: Some(4),
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: None,
            abandoned: AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(300),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();

    let guard = pool.borrow().await.unwrap();
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        guard.touch();
    }
    assert_eq!(pool.num_active(), 1, "touched borrow is never reclaimed");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.num_active(), 0, "reclaimed once the touches stop");
    drop(guard);
}

#[tokio::test(start_paused = true)]
async fn maintenance_stops_after_close() {
    let pool = Pool::new(
        Numbers::new(),
        PoolConfig {
            max_total: Some(4),
            min_idle: 2,
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: None,
            ..Default::default()
        },
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.num_idle(), 2);

    pool.close().await;
    assert_eq!(pool.num_idle(), 0);

    // No refill happens once the pool is closed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.num_idle(), 0);
    let stats = pool.stats();
    assert_eq!(stats.created, stats.destroyed);
}

#[tokio::test(start_paused = true)]
async fn keyed_maintenance_refills_live_keys() {
    let pool: KeyedPool<&'static str, Numbers> = KeyedPool::new(
        Numbers::new(),
        KeyedPoolConfig {
            max_total: Some(8),
            min_idle_per_key: 1,
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: None,
            ..Default::default()
        },
    )
    .unwrap();

    // Keep "a" alive with a checked-out object so clear cannot drop the
    // sub-pool, then empty its idle store.
    let held = pool.borrow("a").await.unwrap();
    pool.prepare(&"a").await.unwrap();
    assert_eq!(pool.num_idle_for(&"a"), 1);
    pool.clear(&"a").await;
    assert_eq!(pool.num_idle_for(&"a"), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.num_idle_for(&"a"), 1, "live key refilled to its floor");
    pool.put_back(held).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn keyed_background_evictor_covers_all_keys() {
    let pool: KeyedPool<&'static str, Numbers> = KeyedPool::new(
        Numbers::new(),
        KeyedPoolConfig {
            max_total: Some(8),
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            min_evictable_idle_time: Some(Duration::from_millis(50)),
            num_tests_per_eviction_run: 2,
            ..Default::default()
        },
    )
    .unwrap();

    for key in ["a", "b", "c"] {
        let guard = pool.borrow(key).await.unwrap();
        pool.put_back(guard).await.unwrap();
    }
    assert_eq!(pool.num_idle(), 3);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(pool.num_idle(), 0, "rotation reaches every key");
    assert_eq!(pool.stats().destroyed_by_evictor, 3);
}
