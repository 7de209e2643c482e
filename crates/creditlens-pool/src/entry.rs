//! Pool entries, their lifecycle states, and the leases handed to callers.

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::key::PoolKey;
use crate::stats::EntryStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one acquisition. A fresh id is minted every time an entry is
/// lent out, so releasing a stale id never returns someone else's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a pool entry.
///
/// ```text
/// Initializing ──► Ready ⇄ Busy
///      │             │      │
///      └──► Error ◄──┴──────┘
///            │
/// Ready ─────┴──► Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Initializing,
    Ready,
    Busy,
    Error,
    Removed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Initializing => "initializing",
            EntryStatus::Ready => "ready",
            EntryStatus::Busy => "busy",
            EntryStatus::Error => "error",
            EntryStatus::Removed => "removed",
        }
    }
}

/// Outcome of the most recent health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Broadcast to callers waiting on an initializing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InitOutcome {
    Pending,
    Ready,
    Failed(String),
}

/// The pool's bookkeeping record for one handle.
pub(crate) struct PoolEntry<H> {
    pub id: EntryId,
    pub key: PoolKey,
    pub model_type: String,
    pub config: ModelConfig,
    pub status: EntryStatus,
    pub health: HealthState,
    pub handle: Option<H>,
    /// Set while the handle is lent out; survives a health downgrade to `Error`.
    pub lease: Option<LeaseId>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_used: Instant,
    pub usage_count: u64,
    pub consecutive_errors: u32,
    pub last_probe_latency: Option<Duration>,
    /// Cancels this entry's health monitor.
    pub monitor: CancellationToken,
    pub init: watch::Sender<InitOutcome>,
}

impl<H: Clone> PoolEntry<H> {
    pub fn initializing(
        key: PoolKey,
        model_type: String,
        config: ModelConfig,
        monitor: CancellationToken,
    ) -> Self {
        let (init, _) = watch::channel(InitOutcome::Pending);
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            key,
            model_type,
            config,
            status: EntryStatus::Initializing,
            health: HealthState::Unknown,
            handle: None,
            lease: None,
            created_at: now,
            last_used_at: now,
            last_used: Instant::now(),
            usage_count: 0,
            consecutive_errors: 0,
            last_probe_latency: None,
            monitor,
            init,
        }
    }

    /// Ready and not lent out.
    pub fn is_idle(&self) -> bool {
        self.status == EntryStatus::Ready && self.lease.is_none()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }

    /// `Initializing → Ready` once the handle passed its first probe.
    pub fn mark_ready(&mut self, handle: H) {
        self.handle = Some(handle);
        self.status = EntryStatus::Ready;
        self.health = HealthState::Healthy;
        self.touch();
        self.init.send_replace(InitOutcome::Ready);
    }

    /// `Ready → Busy`. Returns `None` if the entry cannot be lent right now.
    pub fn lend(&mut self) -> Option<Lease<H>> {
        if !self.is_idle() {
            return None;
        }
        let handle = self.handle.clone()?;
        let id = LeaseId::new();
        self.status = EntryStatus::Busy;
        self.lease = Some(id);
        self.usage_count += 1;
        self.touch();
        Some(Lease {
            id,
            entry_id: self.id,
            key: self.key.clone(),
            model_type: self.model_type.clone(),
            handle,
        })
    }

    /// Undo a `lend` whose lease never reached its caller.
    pub fn unlend(&mut self) {
        self.lease = None;
        self.usage_count = self.usage_count.saturating_sub(1);
        if self.status == EntryStatus::Busy {
            self.status = EntryStatus::Ready;
        }
    }

    /// `Busy → Ready`; an entry downgraded to `Error` while lent stays in `Error`.
    pub fn give_back(&mut self) {
        self.lease = None;
        if self.status == EntryStatus::Busy {
            self.status = EntryStatus::Ready;
        }
        self.touch();
    }

    pub fn snapshot(&self) -> EntryStats {
        EntryStats {
            id: self.id,
            key: self.key.to_string(),
            model_type: self.model_type.clone(),
            status: self.status,
            health: self.health,
            leased: self.lease.is_some(),
            usage_count: self.usage_count,
            consecutive_errors: self.consecutive_errors,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            last_probe_latency_ms: self.last_probe_latency.map(|d| d.as_millis() as u64),
        }
    }
}

/// Exclusive use of a pooled handle, returned by `ModelPool::acquire`.
///
/// Hand the id back with `ModelPool::release` exactly once, and do not keep
/// clones of the handle afterwards. If the entry is replaced while lent out,
/// releasing is still accepted until the next idle sweep after
/// `PoolConfig::idle_threshold` has passed.
#[derive(Debug)]
pub struct Lease<H> {
    id: LeaseId,
    entry_id: EntryId,
    key: PoolKey,
    model_type: String,
    handle: H,
}

impl<H> Lease<H> {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}
