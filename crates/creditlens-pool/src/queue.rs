//! FIFO of callers waiting for capacity.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ModelConfig;
use crate::entry::Lease;
use crate::error::Result;
use crate::key::PoolKey;

pub(crate) type LeaseSender<H> = oneshot::Sender<Result<Lease<H>>>;
pub(crate) type LeaseReceiver<H> = oneshot::Receiver<Result<Lease<H>>>;

pub(crate) struct QueuedRequest<H> {
    pub id: u64,
    pub key: PoolKey,
    pub model_type: String,
    pub config: ModelConfig,
    pub tx: LeaseSender<H>,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

/// Every request leaves the queue exactly once: served, expired, withdrawn
/// by its waiter, or failed at shutdown.
pub(crate) struct AcquisitionQueue<H> {
    requests: VecDeque<QueuedRequest<H>>,
    next_id: u64,
}

impl<H> AcquisitionQueue<H> {
    pub fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn push(
        &mut self,
        key: PoolKey,
        model_type: String,
        config: ModelConfig,
        tx: LeaseSender<H>,
        deadline: Instant,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.requests.push_back(QueuedRequest {
            id,
            key,
            model_type,
            config,
            tx,
            enqueued_at: Instant::now(),
            deadline,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn front(&self) -> Option<&QueuedRequest<H>> {
        self.requests.front()
    }

    pub fn pop_front(&mut self) -> Option<QueuedRequest<H>> {
        self.requests.pop_front()
    }

    /// Withdraw a request whose waiter gave up.
    pub fn remove(&mut self, id: u64) -> Option<QueuedRequest<H>> {
        let pos = self.requests.iter().position(|r| r.id == id)?;
        self.requests.remove(pos)
    }

    /// Take out every request whose deadline has passed, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<QueuedRequest<H>> {
        let (expired, live): (VecDeque<_>, VecDeque<_>) =
            self.requests.drain(..).partition(|r| r.deadline <= now);
        self.requests = live;
        expired.into()
    }

    /// Drop requests nobody is listening to any more.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| !r.tx.is_closed());
        before - self.requests.len()
    }

    pub fn drain_all(&mut self) -> Vec<QueuedRequest<H>> {
        self.requests.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(model: &str) -> (PoolKey, ModelConfig) {
        let config = ModelConfig::new(model);
        (PoolKey::new("text-generation", &config).unwrap(), config)
    }

    fn push(
        queue: &mut AcquisitionQueue<String>,
        model: &str,
        deadline: Instant,
    ) -> (u64, LeaseReceiver<String>) {
        let (k, c) = key(model);
        let (tx, rx) = oneshot::channel();
        (queue.push(k, "text-generation".into(), c, tx, deadline), rx)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = AcquisitionQueue::new();
        let later = Instant::now() + Duration::from_secs(60);
        let (a, _ra) = push(&mut queue, "a", later);
        let (b, _rb) = push(&mut queue, "b", later);
        let (c, _rc) = push(&mut queue, "c", later);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().id, a);
        assert_eq!(queue.pop_front().unwrap().id, b);
        assert_eq!(queue.pop_front().unwrap().id, c);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_by_id_keeps_order_of_the_rest() {
        let mut queue = AcquisitionQueue::new();
        let later = Instant::now() + Duration::from_secs(60);
        let (a, _ra) = push(&mut queue, "a", later);
        let (b, _rb) = push(&mut queue, "b", later);
        let (c, _rc) = push(&mut queue, "c", later);

        assert_eq!(queue.remove(b).unwrap().id, b);
        assert!(queue.remove(b).is_none(), "a request leaves the queue only once");
        assert_eq!(queue.pop_front().unwrap().id, a);
        assert_eq!(queue.pop_front().unwrap().id, c);
    }

    #[test]
    fn test_expire_only_takes_past_deadlines() {
        let mut queue = AcquisitionQueue::new();
        let now = Instant::now();
        let (stale, _r1) = push(&mut queue, "stale", now - Duration::from_millis(1));
        let (fresh, _r2) = push(&mut queue, "fresh", now + Duration::from_secs(5));

        let expired = queue.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().id, fresh);
    }

    #[test]
    fn test_prune_abandoned() {
        let mut queue = AcquisitionQueue::new();
        let later = Instant::now() + Duration::from_secs(60);
        let (_gone, rx_gone) = push(&mut queue, "gone", later);
        let (kept, _rx_kept) = push(&mut queue, "kept", later);
        drop(rx_gone);

        assert_eq!(queue.prune_abandoned(), 1);
        assert_eq!(queue.front().unwrap().id, kept);
    }
}
