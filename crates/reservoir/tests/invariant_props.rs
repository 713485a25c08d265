//! Property tests over borrow/return/invalidate/clear sequences.
//!
//! Whatever order operations arrive in, the accounting identities must
//! hold: `created − destroyed == active + idle`, the capacity bound is
//! never exceeded, and no object is ever lost.

use std::sync::atomic::{AtomicU32, Ordering};

use proptest::prelude::*;

use reservoir::{Error, Factory, Pool, PoolConfig};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct TestError(&'static str);

struct Numbers(AtomicU32);

impl Factory for Numbers {
    type Object = u32;
    type Error = TestError;

    async fn create(&self) -> Result<u32, TestError> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

const MAX_TOTAL: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Borrow,
    Return,
    Invalidate,
    Clear,
    Evict,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Borrow),
        3 => Just(Op::Return),
        1 => Just(Op::Invalidate),
        1 => Just(Op::Clear),
        1 => Just(Op::Evict),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn accounting_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let factory = Numbers(AtomicU32::new(0));
            let pool = Pool::new(
                factory,
                PoolConfig {
                    max_total: Some(MAX_TOTAL),
                    max_idle: Some(2),
                    block_when_exhausted: false,
                    ..Default::default()
                },
            )
            .unwrap();

            let mut held = Vec::new();
            for op in ops {
                match op {
                    Op::Borrow => match pool.borrow().await {
                        Ok(guard) => held.push(guard),
                        Err(Error::Exhausted { .. }) => {}
                        Err(other) => panic!("unexpected borrow error: {other}"),
                    },
                    Op::Return => {
                        if let Some(guard) = held.pop() {
                            pool.put_back(guard).await.unwrap();
                        }
                    }
                    Op::Invalidate => {
                        if let Some(guard) = held.pop() {
                            pool.invalidate(guard).await.unwrap();
                        }
                    }
                    Op::Clear => pool.clear().await,
                    Op::Evict => pool.evict().await,
                }

                let stats = pool.stats();
                prop_assert_eq!(
                    stats.created - stats.destroyed,
                    (stats.num_active + stats.num_idle) as u64
                );
                prop_assert!(stats.num_active + stats.num_idle <= MAX_TOTAL);
                prop_assert_eq!(stats.num_active, held.len());
            }

            for guard in held.drain(..) {
                pool.put_back(guard).await.unwrap();
            }
            pool.close().await;
            let stats = pool.stats();
            prop_assert_eq!(stats.created, stats.destroyed);
            prop_assert_eq!(stats.num_active, 0);
            Ok(())
        })?;
    }
}
