//! Periodic sweep that closes entries left idle past the threshold.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::RemovalReason;
use crate::pool::PoolCore;

pub(crate) fn spawn_reclaimer<H>(core: Weak<PoolCore<H>>, cancel: CancellationToken, every: Duration)
where
    H: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let Some(pool) = core.upgrade() else { break };
            let reclaimed = pool.reclaim_idle();
            if reclaimed > 0 {
                debug!(reclaimed, "Idle sweep finished");
            }
        }
        debug!("Idle reclaimer stopped");
    });
}

impl<H: Clone + Send + Sync + 'static> PoolCore<H> {
    /// Remove ready, unleased entries unused for longer than the idle threshold,
    /// forget retired leases older than that, then serve or expire whatever is queued.
    pub(crate) fn reclaim_idle(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock();
        if state.shutdown {
            return 0;
        }
        let now = Instant::now();
        let threshold = self.config.idle_threshold;
        let idle: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.is_idle() && now.duration_since(e.last_used) > threshold)
            .map(|e| e.id)
            .collect();

        for id in &idle {
            self.remove_entry(&mut state, *id, RemovalReason::Idle);
        }
        let before = state.retired.len();
        state
            .retired
            .retain(|_, removed_at| now.duration_since(*removed_at) <= threshold);
        let forgotten = before - state.retired.len();
        if forgotten > 0 {
            debug!(forgotten, "Dropped unreleased leases of removed entries");
        }
        if !idle.is_empty() {
            info!(reclaimed = idle.len(), active = state.active(), "Reclaimed idle entries");
        }
        // Also expires queued requests whose callers have not woken up yet.
        self.drain_queue(&mut state);
        idle.len()
    }
}
