// Pool throughput benchmarks.
//
// Measures raw borrow/return overhead with a zero-cost object (no I/O,
// instant create/destroy).

use std::convert::Infallible;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use reservoir::{Factory, Pool, PoolConfig};

// -- Minimal no-op factory for measuring pool overhead only --

struct NoOpFactory;

impl Factory for NoOpFactory {
    type Object = u64;
    type Error = Infallible;

    async fn create(&self) -> Result<u64, Infallible> {
        Ok(0)
    }
}

fn pool_config(max_total: usize) -> PoolConfig {
    PoolConfig {
        max_total: Some(max_total),
        max_idle: Some(max_total),
        ..Default::default()
    }
}

fn single_thread_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");

    let pool = rt.block_on(async {
        let pool = Pool::new(NoOpFactory, pool_config(64)).expect("failed to create pool");
        // Warm up: one object in the idle store so iterations reuse it.
        let guard = pool.borrow().await.unwrap();
        pool.put_back(guard).await.unwrap();
        pool
    });

    c.bench_function("single_thread_borrow_return", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let guard = pool.borrow().await.unwrap();
                pool.put_back(guard).await.unwrap();
                black_box(())
            }
        });
    });
}

fn multi_thread_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let pool = rt.block_on(async {
        let pool = Pool::new(NoOpFactory, pool_config(64)).expect("failed to create pool");
        let mut guards = Vec::new();
        for _ in 0..8 {
            guards.push(pool.borrow().await.unwrap());
        }
        for guard in guards {
            pool.put_back(guard).await.unwrap();
        }
        pool
    });

    c.bench_function("multi_thread_borrow_return", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let guard = pool.borrow().await.unwrap();
                pool.put_back(guard).await.unwrap();
                black_box(())
            }
        });
    });
}

fn contended_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");

    // Small pool to force handoffs between concurrent borrowers.
    let pool = rt.block_on(async {
        Pool::new(NoOpFactory, pool_config(4)).expect("failed to create pool")
    });

    c.bench_function("contended_borrow_return_4slots", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let guard = pool.borrow().await.unwrap();
                pool.put_back(guard).await.unwrap();
                black_box(())
            }
        });
    });
}

criterion_group!(
    benches,
    single_thread_throughput,
    multi_thread_throughput,
    contended_throughput,
);
criterion_main!(benches);
