//! Per-entry health monitoring.
//!
//! Every ready entry gets one monitor task. It probes the handle on a fixed
//! period, classifies the outcome and reports back to the pool, which owns
//! every status transition. The task holds only a weak reference to the pool
//! and stops when its cancellation token fires or the pool is gone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::{EntryId, EntryStatus, HealthState};
use crate::events::{PoolEvent, RemovalReason};
use crate::factory::{ModelError, ModelFactory};
use crate::pool::PoolCore;

pub(crate) fn spawn_monitor<H>(
    core: Weak<PoolCore<H>>,
    entry_id: EntryId,
    cancel: CancellationToken,
    interval: Duration,
) where
    H: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(entry = %entry_id, interval_ms = interval.as_millis() as u64, "Health monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let Some(pool) = core.upgrade() else { break };
            let Some((handle, factory)) = pool.probe_target(entry_id) else { break };
            let probe_timeout = pool.config.probe_timeout;
            let degraded_latency = pool.config.degraded_latency;
            // Do not keep the pool alive across the probe.
            drop(pool);

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(probe_timeout, factory.probe(&handle)) => {
                    r.unwrap_or(Err(ModelError::Timeout(probe_timeout)))
                }
            };
            let latency = started.elapsed();
            let health = classify(&outcome, latency, degraded_latency);

            let Some(pool) = core.upgrade() else { break };
            let error = outcome.err().map(|e| e.to_string());
            if !pool.record_probe(entry_id, health, latency, error) {
                break;
            }
        }
        debug!(entry = %entry_id, "Health monitor stopped");
    });
}

/// Success within `degraded_latency` is healthy, slower success is degraded,
/// any error (including a timeout) is unhealthy.
pub(crate) fn classify(
    outcome: &Result<(), ModelError>,
    latency: Duration,
    degraded_latency: Duration,
) -> HealthState {
    match outcome {
        Err(_) => HealthState::Unhealthy,
        Ok(()) if latency > degraded_latency => HealthState::Degraded,
        Ok(()) => HealthState::Healthy,
    }
}

impl<H: Clone + Send + Sync + 'static> PoolCore<H> {
    /// Handle and factory to probe, or `None` if the entry is gone.
    pub(crate) fn probe_target(&self, entry_id: EntryId) -> Option<(H, Arc<dyn ModelFactory<H>>)> {
        let state = self.state.lock();
        if state.shutdown {
            return None;
        }
        let entry = state.entries.get(&entry_id)?;
        let handle = entry.handle.clone()?;
        let factory = self.factories.get(&entry.model_type)?;
        Some((handle, factory))
    }

    /// Apply one probe result. Returns whether the monitor should keep running.
    pub(crate) fn record_probe(
        self: &Arc<Self>,
        entry_id: EntryId,
        health: HealthState,
        latency: Duration,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        let threshold = self.config.error_threshold;
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return false;
        };

        let previous = entry.health;
        entry.health = health;
        entry.last_probe_latency = Some(latency);
        let key = entry.key.clone();

        let mut recovered = false;
        match health {
            HealthState::Healthy | HealthState::Degraded => {
                entry.consecutive_errors = 0;
                if entry.status == EntryStatus::Error && entry.lease.is_none() {
                    entry.status = EntryStatus::Ready;
                    recovered = true;
                    info!(key = %key, entry = %entry_id, "Entry recovered");
                }
                if health == HealthState::Degraded {
                    warn!(
                        key = %key,
                        entry = %entry_id,
                        latency_ms = latency.as_millis() as u64,
                        "Probe succeeded slowly"
                    );
                }
            }
            HealthState::Unhealthy | HealthState::Unknown => {
                entry.consecutive_errors += 1;
                if matches!(entry.status, EntryStatus::Ready | EntryStatus::Busy) {
                    entry.status = EntryStatus::Error;
                }
                warn!(
                    key = %key,
                    entry = %entry_id,
                    consecutive_errors = entry.consecutive_errors,
                    error = error.as_deref().unwrap_or("unknown"),
                    "Health probe failed"
                );
            }
        }

        let consecutive_errors = entry.consecutive_errors;
        let replace = consecutive_errors >= threshold;
        let (model_type, config) = (entry.model_type.clone(), entry.config.clone());

        if previous != health {
            self.emit(PoolEvent::HealthChanged {
                entry: entry_id,
                key: key.to_string(),
                health,
                consecutive_errors,
            });
        }

        if !replace {
            if recovered {
                self.drain_queue(&mut state);
            }
            return true;
        }

        self.remove_entry(&mut state, entry_id, RemovalReason::Unhealthy);
        self.drain_queue(&mut state);
        if !state.shutdown && state.active() < self.config.max_connections {
            info!(key = %key, "Building replacement for unhealthy entry");
            self.start_construction(&mut state, key, model_type, config, None);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_fast_success_is_healthy() {
        assert_eq!(classify(&Ok(()), Duration::from_millis(20), SLOW), HealthState::Healthy);
    }

    #[test]
    fn test_slow_success_is_degraded() {
        assert_eq!(classify(&Ok(()), Duration::from_millis(900), SLOW), HealthState::Degraded);
    }

    #[test]
    fn test_latency_at_threshold_is_still_healthy() {
        assert_eq!(classify(&Ok(()), SLOW, SLOW), HealthState::Healthy);
    }

    #[test]
    fn test_errors_and_timeouts_are_unhealthy() {
        let err = Err(ModelError::Unavailable("connection refused".into()));
        assert_eq!(classify(&err, Duration::from_millis(5), SLOW), HealthState::Unhealthy);

        let timeout = Err(ModelError::Timeout(Duration::from_secs(5)));
        assert_eq!(classify(&timeout, Duration::from_secs(5), SLOW), HealthState::Unhealthy);
    }
}
