//! creditlens-pool: connection pool for remote AI model backends.
//!
//! The pool hands out exclusive leases on client handles built by a
//! per-model-type [`ModelFactory`]. It bounds the number of live handles,
//! queues callers FIFO when the pool is full, probes every handle in the
//! background and replaces the ones that keep failing, and reclaims handles
//! nobody has used for a while.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use creditlens_pool::{FactoryRegistry, ModelConfig, ModelFactory, ModelPool, PoolConfig};
//!
//! # async fn run<H, F>(factory: Arc<F>) -> anyhow::Result<()>
//! # where H: Clone + Send + Sync + 'static, F: ModelFactory<H> + 'static {
//! let registry = FactoryRegistry::new().register("text-generation", factory);
//! let pool = ModelPool::new(PoolConfig::default(), registry)?;
//!
//! let config = ModelConfig::new("gemini-1.5-flash");
//! let lease = pool.acquire("text-generation", &config, Duration::from_secs(10)).await?;
//! // ... use lease.handle() ...
//! pool.release(lease.id())?;
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod factory;
pub mod key;
pub mod pool;
pub mod stats;

mod health;
mod queue;
mod reclaimer;

pub use config::{ModelConfig, PoolConfig};
pub use entry::{EntryId, EntryStatus, HealthState, Lease, LeaseId};
pub use error::{PoolError, Result};
pub use events::{PoolEvent, RemovalReason};
pub use factory::{FactoryRegistry, ModelError, ModelFactory};
pub use key::PoolKey;
pub use pool::ModelPool;
pub use stats::{EntryStats, PoolCounters, PoolStats};
