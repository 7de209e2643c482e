//! `ModelPool` façade: admission control, construction, release and shutdown.
//!
//! All bookkeeping (entry map, queue, counters) sits behind one mutex in
//! [`PoolCore`]. Factory calls, probes and waits always happen with the lock
//! released; only the state transitions around them are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ModelConfig, PoolConfig};
use crate::entry::{EntryId, EntryStatus, InitOutcome, Lease, LeaseId, PoolEntry};
use crate::error::{PoolError, Result};
use crate::events::{PoolEvent, RemovalReason};
use crate::factory::{FactoryRegistry, ModelError, ModelFactory};
use crate::key::{normalize_model_type, PoolKey};
use crate::queue::{AcquisitionQueue, LeaseReceiver, LeaseSender};
use crate::stats::{PoolCounters, PoolStats};
use crate::{health, reclaimer};

/// Mutable pool state. Only ever touched with `PoolCore::state` held.
pub(crate) struct PoolState<H> {
    pub entries: HashMap<EntryId, PoolEntry<H>>,
    pub queue: AcquisitionQueue<H>,
    pub counters: PoolCounters,
    /// Leases whose entry was removed while lent out, with the removal time.
    /// Releasing them is a no-op; the idle sweep forgets them after `idle_threshold`.
    pub retired: HashMap<LeaseId, Instant>,
    pub shutdown: bool,
}

impl<H: Clone> PoolState<H> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: AcquisitionQueue::new(),
            counters: PoolCounters::default(),
            retired: HashMap::new(),
            shutdown: false,
        }
    }

    /// Every entry in the map occupies one capacity slot; removed entries leave the map.
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Most recently used idle entry for `key`.
    fn idle_for(&self, key: &PoolKey) -> Option<EntryId> {
        self.entries
            .values()
            .filter(|e| &e.key == key && e.is_idle())
            .max_by_key(|e| e.last_used)
            .map(|e| e.id)
    }

    fn initializing_for(&self, key: &PoolKey) -> Option<&PoolEntry<H>> {
        self.entries
            .values()
            .find(|e| &e.key == key && e.status == EntryStatus::Initializing)
    }

    /// `Error` entries for `key` that nobody is holding.
    fn stale_for(&self, key: &PoolKey) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| &e.key == key && e.status == EntryStatus::Error && e.lease.is_none())
            .map(|e| e.id)
            .collect()
    }

    /// Least recently used idle entry of any key.
    fn lru_idle(&self) -> Option<EntryId> {
        self.entries
            .values()
            .filter(|e| e.is_idle())
            .min_by_key(|e| e.last_used)
            .map(|e| e.id)
    }

    /// Entry to give up for a slot: an unleased `Error` entry of any key
    /// first, otherwise the least recently used idle one.
    fn evictable(&self) -> Option<(EntryId, RemovalReason)> {
        self.entries
            .values()
            .filter(|e| e.status == EntryStatus::Error && e.lease.is_none())
            .min_by_key(|e| e.last_used)
            .map(|e| (e.id, RemovalReason::Stale))
            .or_else(|| self.lru_idle().map(|id| (id, RemovalReason::Pressure)))
    }

    fn holding(&self, lease: LeaseId) -> Option<EntryId> {
        self.entries
            .values()
            .find(|e| e.lease == Some(lease))
            .map(|e| e.id)
    }
}

pub(crate) struct PoolCore<H: Send + Sync + 'static> {
    pub config: PoolConfig,
    pub factories: FactoryRegistry<H>,
    pub state: Mutex<PoolState<H>>,
    pub events: broadcast::Sender<PoolEvent>,
    /// Parent of every health monitor token and of the idle reclaimer.
    pub cancel: CancellationToken,
}

impl<H: Send + Sync + 'static> Drop for PoolCore<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What `admit` decided for one acquisition attempt.
enum Admission<H: Clone + Send + Sync + 'static> {
    Leased(Lease<H>),
    AwaitInit(watch::Receiver<InitOutcome>),
    Pending(PendingLease<H>),
}

impl<H: Clone + Send + Sync + 'static> PoolCore<H> {
    pub fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn admit(
        self: &Arc<Self>,
        key: &PoolKey,
        model_type: &str,
        config: &ModelConfig,
        deadline: Instant,
    ) -> Result<Admission<H>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }

        let stale = state.stale_for(key);
        if !stale.is_empty() {
            for id in stale {
                self.remove_entry(&mut state, id, RemovalReason::Stale);
            }
            // Freed slots go to earlier waiters first.
            self.drain_queue(&mut state);
        }

        if let Some(id) = state.idle_for(key) {
            let lease = state.entries.get_mut(&id).and_then(|e| e.lend());
            if let Some(lease) = lease {
                state.counters.acquisitions += 1;
                debug!(key = %key, entry = %id, lease = %lease.id(), "Reusing ready entry");
                return Ok(Admission::Leased(lease));
            }
        }

        if let Some(entry) = state.initializing_for(key) {
            debug!(key = %key, entry = %entry.id, "Waiting for initializing entry");
            return Ok(Admission::AwaitInit(entry.init.subscribe()));
        }

        let (tx, rx) = oneshot::channel();

        if state.active() >= self.config.max_connections && state.queue.is_empty() {
            if let Some((victim, reason)) = state.evictable() {
                self.remove_entry(&mut state, victim, reason);
            }
        }

        if state.active() < self.config.max_connections {
            self.start_construction(&mut state, key.clone(), model_type.to_string(), config.clone(), Some(tx));
            return Ok(Admission::Pending(PendingLease::new(self, None, model_type, rx)));
        }

        let request = state
            .queue
            .push(key.clone(), model_type.to_string(), config.clone(), tx, deadline);
        let queued = state.queue.len();
        debug!(key = %key, queued, "Pool at capacity, request queued");
        self.emit(PoolEvent::RequestQueued {
            key: key.to_string(),
            queued,
        });
        Ok(Admission::Pending(PendingLease::new(self, Some(request), model_type, rx)))
    }

    /// Reserve a slot with an `Initializing` entry and build the handle in the background.
    ///
    /// Construction never runs on the caller's task, so a caller that times
    /// out or is cancelled cannot strand the entry in `Initializing`.
    pub(crate) fn start_construction(
        self: &Arc<Self>,
        state: &mut PoolState<H>,
        key: PoolKey,
        model_type: String,
        config: ModelConfig,
        requester: Option<LeaseSender<H>>,
    ) {
        let Some(factory) = self.factories.get(&model_type) else {
            if let Some(tx) = requester {
                let _ = tx.send(Err(PoolError::UnknownModelType(model_type)));
            }
            return;
        };

        let entry = PoolEntry::initializing(
            key.clone(),
            model_type.clone(),
            config.clone(),
            self.cancel.child_token(),
        );
        let entry_id = entry.id;
        state.entries.insert(entry_id, entry);
        debug!(
            key = %key,
            entry = %entry_id,
            active = state.active(),
            capacity = self.config.max_connections,
            "Admitted new entry"
        );

        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.construct(entry_id, factory, model_type, config, requester).await;
        });
    }

    async fn construct(
        self: Arc<Self>,
        entry_id: EntryId,
        factory: Arc<dyn ModelFactory<H>>,
        model_type: String,
        config: ModelConfig,
        requester: Option<LeaseSender<H>>,
    ) {
        let started = Instant::now();
        let limit = self.config.construction_timeout;
        let attempt = async {
            let handle = factory.create(&model_type, &config).await?;
            factory.probe(&handle).await?;
            Ok::<H, ModelError>(handle)
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            r = tokio::time::timeout(limit, attempt) => {
                Some(r.unwrap_or(Err(ModelError::Timeout(limit))))
            }
        };

        let mut state = self.state.lock();
        let Some(result) = result.filter(|_| !state.shutdown && state.entries.contains_key(&entry_id)) else {
            if let Some(tx) = requester {
                let _ = tx.send(Err(PoolError::Shutdown));
            }
            return;
        };

        match result {
            Ok(handle) => {
                self.finish_construction(&mut state, entry_id, handle, started.elapsed(), requester)
            }
            Err(err) => self.fail_construction(&mut state, entry_id, &model_type, err, requester),
        }
    }

    fn finish_construction(
        self: &Arc<Self>,
        state: &mut PoolState<H>,
        entry_id: EntryId,
        handle: H,
        elapsed: Duration,
        requester: Option<LeaseSender<H>>,
    ) {
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return;
        };
        entry.mark_ready(handle);
        let key = entry.key.clone();
        let token = entry.monitor.clone();
        let interval = entry
            .config
            .health_check_interval()
            .unwrap_or(self.config.health_check_interval);
        state.counters.created += 1;

        info!(
            key = %key,
            entry = %entry_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Model handle ready"
        );
        self.emit(PoolEvent::EntryCreated {
            entry: entry_id,
            key: key.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        health::spawn_monitor(Arc::downgrade(self), entry_id, token, interval);

        let delivered = match requester {
            Some(tx) => self.deliver(state, entry_id, tx),
            None => false,
        };
        if !delivered {
            self.drain_queue(state);
        }
    }

    fn fail_construction(
        self: &Arc<Self>,
        state: &mut PoolState<H>,
        entry_id: EntryId,
        model_type: &str,
        err: ModelError,
        requester: Option<LeaseSender<H>>,
    ) {
        let reason = err.to_string();
        if let Some(entry) = state.entries.remove(&entry_id) {
            entry.monitor.cancel();
            entry.init.send_replace(InitOutcome::Failed(reason.clone()));
            warn!(key = %entry.key, entry = %entry_id, error = %reason, "Model handle construction failed");
            self.emit(PoolEvent::ConstructionFailed {
                key: entry.key.to_string(),
                reason: reason.clone(),
            });
        }
        state.counters.construction_failures += 1;

        if let Some(tx) = requester {
            let _ = tx.send(Err(PoolError::ConstructionFailed {
                model_type: model_type.to_string(),
                reason,
            }));
        }
        self.drain_queue(state);
    }

    /// Lend `entry_id` to the waiter behind `tx`. Returns whether it was taken.
    fn deliver(&self, state: &mut PoolState<H>, entry_id: EntryId, tx: LeaseSender<H>) -> bool {
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return false;
        };
        let Some(lease) = entry.lend() else {
            return false;
        };
        let lease_id = lease.id();
        if tx.send(Ok(lease)).is_err() {
            // Waiter gave up between dequeue and delivery.
            entry.unlend();
            return false;
        }
        state.counters.acquisitions += 1;
        debug!(entry = %entry_id, lease = %lease_id, "Lease delivered to waiter");
        true
    }

    /// Serve queued requests, oldest first, for as long as capacity allows.
    pub(crate) fn drain_queue(self: &Arc<Self>, state: &mut PoolState<H>) {
        if state.shutdown {
            return;
        }
        self.expire_queued(state);
        state.queue.prune_abandoned();

        while let Some(front) = state.queue.front() {
            if front.tx.is_closed() {
                state.queue.pop_front();
                continue;
            }
            let key = front.key.clone();

            if let Some(id) = state.idle_for(&key) {
                if let Some(request) = state.queue.pop_front() {
                    self.deliver(state, id, request.tx);
                }
                continue;
            }

            if state.active() >= self.config.max_connections {
                match state.evictable() {
                    Some((victim, reason)) => {
                        self.remove_entry(state, victim, reason);
                    }
                    None => break,
                }
            }

            let Some(request) = state.queue.pop_front() else {
                break;
            };
            debug!(
                key = %request.key,
                waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                "Serving queued request"
            );
            self.start_construction(state, request.key, request.model_type, request.config, Some(request.tx));
        }
    }

    /// Fail queued requests whose deadline has already passed.
    pub(crate) fn expire_queued(&self, state: &mut PoolState<H>) {
        let now = Instant::now();
        for request in state.queue.expire(now) {
            let waited = now.duration_since(request.enqueued_at);
            let _ = request.tx.send(Err(PoolError::AcquireTimeout {
                model_type: request.model_type,
                waited,
            }));
        }
    }

    /// Drop an entry from the pool, freeing its slot and stopping its monitor.
    pub(crate) fn remove_entry(
        &self,
        state: &mut PoolState<H>,
        entry_id: EntryId,
        reason: RemovalReason,
    ) -> Option<PoolEntry<H>> {
        let mut entry = state.entries.remove(&entry_id)?;
        entry.monitor.cancel();
        entry.status = EntryStatus::Removed;
        if let Some(lease) = entry.lease {
            state.retired.insert(lease, Instant::now());
        }

        match reason {
            RemovalReason::Idle => state.counters.idle_reclaimed += 1,
            RemovalReason::Pressure => state.counters.evictions += 1,
            RemovalReason::Unhealthy => state.counters.health_replacements += 1,
            RemovalReason::Stale => {}
        }

        info!(
            key = %entry.key,
            entry = %entry_id,
            reason = reason.as_str(),
            usage_count = entry.usage_count,
            "Entry removed from pool"
        );
        self.emit(PoolEvent::EntryRemoved {
            entry: entry_id,
            key: entry.key.to_string(),
            reason,
        });
        Some(entry)
    }

    pub(crate) fn release(self: &Arc<Self>, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry_id) = state.holding(lease) else {
            if state.retired.remove(&lease).is_some() {
                debug!(lease = %lease, "Released lease of a removed entry");
                return Ok(());
            }
            return Err(PoolError::UnknownLease(lease));
        };
        if let Some(entry) = state.entries.get_mut(&entry_id) {
            entry.give_back();
            debug!(entry = %entry_id, lease = %lease, status = entry.status.as_str(), "Lease released");
        }
        self.drain_queue(&mut state);
        Ok(())
    }

    fn record_timeout(&self, key: &PoolKey, waited: Duration) {
        self.state.lock().counters.timeouts += 1;
        debug!(key = %key, waited_ms = waited.as_millis() as u64, "Acquire timed out");
        self.emit(PoolEvent::RequestTimedOut {
            key: key.to_string(),
            waited_ms: waited.as_millis() as u64,
        });
    }
}

/// A caller's claim on a lease that will be delivered later: by a background
/// construction or by a queue drain.
///
/// Dropping an unsettled claim withdraws it from the queue; a lease that
/// raced in at that moment goes straight back to the pool.
struct PendingLease<H: Clone + Send + Sync + 'static> {
    core: Arc<PoolCore<H>>,
    request: Option<u64>,
    model_type: String,
    rx: LeaseReceiver<H>,
    settled: bool,
}

impl<H: Clone + Send + Sync + 'static> PendingLease<H> {
    fn new(core: &Arc<PoolCore<H>>, request: Option<u64>, model_type: &str, rx: LeaseReceiver<H>) -> Self {
        Self {
            core: Arc::clone(core),
            request,
            model_type: model_type.to_string(),
            rx,
            settled: false,
        }
    }

    async fn wait(mut self, started: Instant, deadline: Instant) -> Result<Lease<H>> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => {
                self.settled = true;
                result
            }
            Ok(Err(_)) => {
                self.settled = true;
                if self.core.is_shutdown() {
                    Err(PoolError::Shutdown)
                } else {
                    Err(PoolError::ConstructionFailed {
                        model_type: self.model_type.clone(),
                        reason: "construction task ended without a result".to_string(),
                    })
                }
            }
            Err(_) => Err(PoolError::AcquireTimeout {
                model_type: self.model_type.clone(),
                waited: started.elapsed(),
            }),
        }
    }
}

impl<H: Clone + Send + Sync + 'static> Drop for PendingLease<H> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            // Deliveries happen under this lock, so after closing here none can land later.
            let mut state = self.core.state.lock();
            if let Some(id) = self.request {
                state.queue.remove(id);
            }
            self.rx.close();
        }
        if let Ok(Ok(lease)) = self.rx.try_recv() {
            let _ = self.core.release(lease.id());
        }
    }
}

/// Concurrency-safe pool of AI model handles.
///
/// Cheap to clone; all clones share one pool. Background tasks hold weak
/// references only, so dropping the last clone stops them.
pub struct ModelPool<H: Send + Sync + 'static> {
    core: Arc<PoolCore<H>>,
}

impl<H: Send + Sync + 'static> Clone for ModelPool<H> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<H: Send + Sync + 'static> std::fmt::Debug for ModelPool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPool")
            .field("max_connections", &self.core.config.max_connections)
            .field("factories", &self.core.factories)
            .finish()
    }
}

impl<H: Clone + Send + Sync + 'static> ModelPool<H> {
    /// Build a pool and start its idle reclaimer. Must be called inside a Tokio runtime.
    pub fn new(config: PoolConfig, factories: FactoryRegistry<H>) -> Result<Self> {
        config.validate()?;
        if factories.is_empty() {
            warn!("Model pool created without any registered factories");
        }

        let (events, _) = broadcast::channel(config.event_capacity);
        let core = Arc::new(PoolCore {
            config,
            factories,
            state: Mutex::new(PoolState::new()),
            events,
            cancel: CancellationToken::new(),
        });

        reclaimer::spawn_reclaimer(
            Arc::downgrade(&core),
            core.cancel.child_token(),
            core.config.idle_sweep_interval,
        );

        info!(
            capacity = core.config.max_connections,
            model_types = ?core.factories.model_types(),
            "Model pool initialised"
        );
        Ok(Self { core })
    }

    /// Borrow a handle for `(model_type, config)`, waiting at most `timeout`.
    ///
    /// Reuses a ready entry for the same key when there is one, waits for an
    /// entry of that key that is still initializing, builds a new entry while
    /// capacity allows, and otherwise queues FIFO behind earlier callers.
    pub async fn acquire(
        &self,
        model_type: &str,
        config: &ModelConfig,
        timeout: Duration,
    ) -> Result<Lease<H>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let model_type = normalize_model_type(model_type);
        if !self.core.factories.contains(&model_type) {
            return Err(PoolError::UnknownModelType(model_type));
        }
        let key = PoolKey::new(&model_type, config)?;

        let result = self.acquire_until(&key, &model_type, config, started, deadline).await;
        if matches!(result, Err(PoolError::AcquireTimeout { .. })) {
            self.core.record_timeout(&key, started.elapsed());
        }
        result
    }

    async fn acquire_until(
        &self,
        key: &PoolKey,
        model_type: &str,
        config: &ModelConfig,
        started: Instant,
        deadline: Instant,
    ) -> Result<Lease<H>> {
        loop {
            match self.core.admit(key, model_type, config, deadline)? {
                Admission::Leased(lease) => return Ok(lease),
                Admission::Pending(pending) => return pending.wait(started, deadline).await,
                Admission::AwaitInit(mut init) => {
                    let outcome = tokio::time::timeout_at(
                        deadline,
                        init.wait_for(|o| *o != InitOutcome::Pending),
                    )
                    .await
                    .map(|r| r.map(|o| o.clone()));
                    match outcome {
                        Err(_) => {
                            return Err(PoolError::AcquireTimeout {
                                model_type: model_type.to_string(),
                                waited: started.elapsed(),
                            })
                        }
                        Ok(Ok(InitOutcome::Failed(reason))) => {
                            return Err(PoolError::ConstructionFailed {
                                model_type: model_type.to_string(),
                                reason,
                            });
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) => {
                            if self.core.is_shutdown() {
                                return Err(PoolError::Shutdown);
                            }
                        }
                    }
                    // The fresh entry went to whoever triggered it; try again.
                }
            }
        }
    }

    /// Return a lease. Never blocks on I/O; serves the next queued request if any.
    pub fn release(&self, lease: LeaseId) -> Result<()> {
        self.core.release(lease)
    }

    /// Acquire and immediately release, leaving a ready entry behind.
    pub async fn preload(&self, model_type: &str, config: &ModelConfig, timeout: Duration) -> Result<()> {
        let lease = self.acquire(model_type, config, timeout).await?;
        self.release(lease.id())
    }

    /// Run the idle sweep now. Returns how many entries were reclaimed.
    pub fn reclaim_idle(&self) -> usize {
        self.core.reclaim_idle()
    }

    /// Read-only snapshot of counters and entries.
    pub fn stats(&self) -> PoolStats {
        let state = self.core.state.lock();
        let active = state.active();
        let mut entries: Vec<_> = state.entries.values().map(PoolEntry::snapshot).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        PoolStats {
            capacity: self.core.config.max_connections,
            active,
            available: self.core.config.max_connections.saturating_sub(active),
            queued: state.queue.len(),
            shutdown: state.shutdown,
            counters: state.counters.clone(),
            entries,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.core.events.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.core.config
    }

    /// Stop background tasks, fail queued requests and drop every entry. Idempotent.
    pub fn shutdown(&self) {
        let (dropped_entries, failed_requests) = {
            let mut state = self.core.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.core.cancel.cancel();

            let failed = state.queue.drain_all();
            let failed_requests = failed.len();
            for request in failed {
                let _ = request.tx.send(Err(PoolError::Shutdown));
            }

            state.retired.clear();
            let dropped_entries = state.entries.len();
            for (_, entry) in state.entries.drain() {
                entry.monitor.cancel();
            }
            (dropped_entries, failed_requests)
        };

        info!(dropped_entries, failed_requests, "Model pool shut down");
        self.core.emit(PoolEvent::Shutdown {
            dropped_entries,
            failed_requests,
        });
    }
}
