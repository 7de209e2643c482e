//! Shared testing utilities for the CreditLens workspace.
//!
//! [`MockFactory`] stands in for a real model backend: it counts calls,
//! simulates slow or failing construction, and lets tests flip individual
//! handles to unhealthy. All delays use `tokio::time`, so tests running with
//! paused time advance through them instantly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use creditlens_pool::{FactoryRegistry, ModelConfig, ModelError, ModelFactory, ModelPool, PoolConfig};

pub const TEXT_GENERATION: &str = "text-generation";
pub const DOCUMENT_EXTRACTION: &str = "document-extraction";
pub const IMAGE_ANALYSIS: &str = "image-analysis";

/// What the pool hands out when backed by a [`MockFactory`].
#[derive(Debug, PartialEq, Eq)]
pub struct MockHandle {
    /// Sequential, starting at 1 for the first handle the factory builds.
    pub id: u64,
    pub model_type: String,
    pub model: String,
}

pub type MockPool = ModelPool<Arc<MockHandle>>;

#[derive(Debug, Default)]
pub struct MockFactory {
    create_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    next_id: AtomicU64,
    fail_next: AtomicUsize,
    create_failing: AtomicBool,
    probes_failing: AtomicBool,
    unhealthy: Mutex<HashSet<u64>>,
    create_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `create` sleeps this long before returning.
    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        let factory = Self::new();
        factory.set_create_delay(delay);
        factory
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Fail the next `n` calls to `create`, then go back to normal.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_create_failing(&self, failing: bool) {
        self.create_failing.store(failing, Ordering::SeqCst);
    }

    /// Make every probe fail (or succeed again).
    pub fn set_probes_failing(&self, failing: bool) {
        self.probes_failing.store(failing, Ordering::SeqCst);
    }

    /// Make probes of one handle fail until [`MockFactory::mark_healthy`].
    pub fn mark_unhealthy(&self, handle_id: u64) {
        self.unhealthy.lock().insert(handle_id);
    }

    pub fn mark_healthy(&self, handle_id: u64) {
        self.unhealthy.lock().remove(&handle_id);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Handles successfully built so far.
    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        if self.create_failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ModelFactory<Arc<MockHandle>> for MockFactory {
    async fn create(&self, model_type: &str, config: &ModelConfig) -> Result<Arc<MockHandle>, ModelError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(ModelError::Unavailable(format!("mock backend refused {model_type}")));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockHandle {
            id,
            model_type: model_type.to_string(),
            model: config.model.clone(),
        }))
    }

    async fn probe(&self, handle: &Arc<MockHandle>) -> Result<(), ModelError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.probes_failing.load(Ordering::SeqCst) || self.unhealthy.lock().contains(&handle.id) {
            return Err(ModelError::Backend(format!("handle {} failed its probe", handle.id)));
        }
        Ok(())
    }
}

/// Registry serving all three model types from one mock factory.
pub fn mock_registry(factory: &Arc<MockFactory>) -> FactoryRegistry<Arc<MockHandle>> {
    FactoryRegistry::new()
        .register(TEXT_GENERATION, factory.clone())
        .register(DOCUMENT_EXTRACTION, factory.clone())
        .register(IMAGE_ANALYSIS, factory.clone())
}

/// Pool over a fresh [`MockFactory`]. Must be called inside a Tokio runtime.
pub fn mock_pool(config: PoolConfig) -> (MockPool, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let pool = ModelPool::new(config, mock_registry(&factory)).expect("valid pool config");
    (pool, factory)
}

/// Route `tracing` output through the test harness. `RUST_LOG` picks the level.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds, panicking after ~2s.
///
/// Works under paused time as well: each poll sleeps, which lets the runtime
/// auto-advance to the next pending timer.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}
