//! Point-in-time pool snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{EntryId, EntryStatus, HealthState};

/// Lifetime counters, monotonically increasing until the process exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounters {
    pub created: u64,
    pub acquisitions: u64,
    pub construction_failures: u64,
    pub timeouts: u64,
    pub health_replacements: u64,
    pub idle_reclaimed: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryStats {
    pub id: EntryId,
    pub key: String,
    pub model_type: String,
    pub status: EntryStatus,
    pub health: HealthState,
    pub leased: bool,
    pub usage_count: u64,
    pub consecutive_errors: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_probe_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub queued: usize,
    pub shutdown: bool,
    pub counters: PoolCounters,
    pub entries: Vec<EntryStats>,
}

impl PoolStats {
    /// Entries built for `key`, in no particular order.
    pub fn entries_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a EntryStats> + 'a {
        self.entries.iter().filter(move |e| e.key == key)
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}
