//! # Reservoir
//!
//! A generic, thread-safe object pool for expensive resources (connections,
//! sessions, large buffers). A bounded population of objects is created
//! through a user-supplied [`Factory`], lent out as RAII guards, and
//! reclaimed on return; a background task evicts stale idle objects and can
//! sweep abandoned borrows.
//!
//! Two pool flavors share the same machinery: [`Pool`] manages one
//! homogeneous population, and [`KeyedPool`] manages a family of independent
//! sub-pools indexed by a key, bounded by a shared global cap.
//!
//! ```
//! use std::convert::Infallible;
//! use reservoir::{Factory, Pool, PoolConfig};
//!
//! struct Buffers;
//!
//! impl Factory for Buffers {
//!     type Object = Vec<u8>;
//!     type Error = Infallible;
//!
//!     async fn create(&self) -> Result<Vec<u8>, Infallible> {
//!         Ok(Vec::with_capacity(4096))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), reservoir::Error<Infallible>> {
//! let pool = Pool::new(Buffers, PoolConfig::default())?;
//! let mut buf = pool.borrow().await?;
//! buf.extend_from_slice(b"hello");
//! pool.put_back(buf).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod evict;
pub mod factory;
pub mod guard;
pub mod keyed;
pub mod object;
pub mod pool;
pub mod stats;

mod gate;
mod idle;
mod wait;

// Re-exports
pub use config::{AbandonedConfig, KeyedPoolConfig, PoolConfig};
pub use error::{Error, Result};
pub use evict::{DefaultEvictionPolicy, EvictionConfig, EvictionPolicy};
pub use factory::{Factory, KeyedFactory};
pub use guard::Guard;
pub use keyed::{Key, KeyedGuard, KeyedPool, KeyedPoolBuilder};
pub use object::{DestroyMode, PoolState, PooledObject};
pub use pool::{Pool, PoolBuilder};
pub use stats::PoolStats;
