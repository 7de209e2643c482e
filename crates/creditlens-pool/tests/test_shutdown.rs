//! Shutdown semantics: pending callers fail fast and nothing is left behind.

use std::time::Duration;

use creditlens_pool::{ModelConfig, PoolConfig, PoolError, PoolEvent};
use creditlens_test_utils::{eventually, mock_pool, IMAGE_ANALYSIS, TEXT_GENERATION};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(30);

fn flash() -> ModelConfig {
    ModelConfig::new("gemini-1.5-flash")
}

#[tokio::test]
async fn test_shutdown_fails_queued_requests() {
    let (pool, _factory) = mock_pool(PoolConfig::default().with_max_connections(1));
    let mut events = pool.subscribe();

    let holder = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(IMAGE_ANALYSIS, &ModelConfig::default(), WAIT).await })
    };
    eventually("request queued", || pool.stats().queued == 1).await;

    pool.shutdown();

    assert!(matches!(queued.await.unwrap(), Err(PoolError::Shutdown)));
    let stats = pool.stats();
    assert!(stats.shutdown);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
    assert!(stats.entries.is_empty());

    // A lease taken before shutdown has nowhere to go back to.
    assert!(matches!(pool.release(holder.id()), Err(PoolError::UnknownLease(_))));

    let shutdown = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        PoolEvent::Shutdown { dropped_entries, failed_requests } => Some((dropped_entries, failed_requests)),
        _ => None,
    });
    assert_eq!(shutdown, Some((1, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_callers_waiting_on_construction() {
    let (pool, factory) = mock_pool(PoolConfig::default());
    factory.set_create_delay(Duration::from_secs(10));

    let spawn_acquire = || {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(TEXT_GENERATION, &flash(), WAIT).await })
    };
    let builder = spawn_acquire();
    let waiter = spawn_acquire();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(factory.create_calls(), 1);

    pool.shutdown();

    assert!(matches!(builder.await.unwrap(), Err(PoolError::Shutdown)));
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Shutdown)));
    assert_eq!(pool.stats().active, 0);
    assert_eq!(pool.stats().counters.created, 0);
}

#[tokio::test]
async fn test_acquire_after_shutdown_is_rejected() {
    let (pool, factory) = mock_pool(PoolConfig::default());
    pool.shutdown();

    let err = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap_err();
    assert!(matches!(err, PoolError::Shutdown));
    assert!(!err.is_retryable());
    assert_eq!(factory.create_calls(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (pool, _factory) = mock_pool(PoolConfig::default());
    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    let mut events = pool.subscribe();

    pool.shutdown();
    pool.clone().shutdown();

    assert!(pool.stats().shutdown);
    assert_eq!(pool.reclaim_idle(), 0);
    let count = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PoolEvent::Shutdown { .. }))
        .count();
    assert_eq!(count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_monitors_stop_after_shutdown() {
    let (pool, factory) = mock_pool(PoolConfig::default().with_health_check_interval(Duration::from_secs(1)));
    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let probes = factory.probe_calls();

    pool.shutdown();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(factory.probe_calls(), probes);
}
