//! Lifecycle events broadcast to subscribers (metrics exporters, dashboards).

use serde::{Deserialize, Serialize};

use crate::entry::{EntryId, HealthState};

/// Why an entry left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Unused past the idle threshold.
    Idle,
    /// Evicted to make room for a different key.
    Pressure,
    /// Reached the consecutive probe failure threshold.
    Unhealthy,
    /// Found in `Error` while unleased and discarded to free its slot.
    Stale,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Idle => "idle",
            RemovalReason::Pressure => "pressure",
            RemovalReason::Unhealthy => "unhealthy",
            RemovalReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    EntryCreated { entry: EntryId, key: String, elapsed_ms: u64 },
    ConstructionFailed { key: String, reason: String },
    EntryRemoved { entry: EntryId, key: String, reason: RemovalReason },
    HealthChanged { entry: EntryId, key: String, health: HealthState, consecutive_errors: u32 },
    RequestQueued { key: String, queued: usize },
    RequestTimedOut { key: String, waited_ms: u64 },
    Shutdown { dropped_entries: usize, failed_requests: usize },
}
