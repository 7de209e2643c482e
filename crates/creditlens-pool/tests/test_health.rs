//! Health supervision and idle reclamation, driven with paused Tokio time.

use std::time::Duration;

use creditlens_pool::{EntryStatus, HealthState, ModelConfig, PoolConfig, PoolError, PoolEvent, RemovalReason};
use creditlens_test_utils::{eventually, mock_pool, IMAGE_ANALYSIS, TEXT_GENERATION};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(5);

fn flash() -> ModelConfig {
    ModelConfig::new("gemini-1.5-flash")
}

fn probing_every_second(error_threshold: u32) -> PoolConfig {
    PoolConfig::default()
        .with_health_check_interval(Duration::from_secs(1))
        .with_error_threshold(error_threshold)
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_entry_is_replaced_proactively() {
    let (pool, factory) = mock_pool(probing_every_second(2));
    let mut events = pool.subscribe();

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let stats = pool.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.counters.health_replacements, 1);
    assert_eq!(stats.counters.created, 2);
    assert_eq!(stats.entries[0].status, EntryStatus::Ready);
    assert_eq!(stats.entries[0].usage_count, 0);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    assert_eq!(lease.handle().id, 2);
    assert_eq!(pool.stats().entries[0].usage_count, 1);

    let mut removed = None;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::EntryRemoved { reason, .. } = event {
            removed = Some(reason);
        }
    }
    assert_eq!(removed, Some(RemovalReason::Unhealthy));
}

#[tokio::test(start_paused = true)]
async fn test_single_failed_probe_marks_error_and_recovers() {
    let (pool, factory) = mock_pool(probing_every_second(3));

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let entry = pool.stats().entries[0].clone();
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.health, HealthState::Unhealthy);
    assert_eq!(entry.consecutive_errors, 1);

    factory.mark_healthy(1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let entry = pool.stats().entries[0].clone();
    assert_eq!(entry.status, EntryStatus::Ready);
    assert_eq!(entry.health, HealthState::Healthy);
    assert_eq!(entry.consecutive_errors, 0);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    assert_eq!(lease.handle().id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_discards_stale_error_entry() {
    let (pool, factory) = mock_pool(probing_every_second(3));
    let mut events = pool.subscribe();

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.stats().count(EntryStatus::Error), 1);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    assert_eq!(lease.handle().id, 2);

    let stats = pool.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.counters.health_replacements, 0);
    let stale = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, PoolEvent::EntryRemoved { reason: RemovalReason::Stale, .. }));
    assert!(stale);
}

#[tokio::test(start_paused = true)]
async fn test_busy_entry_marked_error_stays_error_after_release() {
    let (pool, factory) = mock_pool(probing_every_second(3));

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let entry = pool.stats().entries[0].clone();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(entry.leased, "in-flight use is not revoked");

    pool.release(lease.id()).unwrap();
    let entry = pool.stats().entries[0].clone();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(!entry.leased);

    let next = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    assert_eq!(next.handle().id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_lease_of_replaced_entry_can_still_be_released() {
    let (pool, factory) = mock_pool(probing_every_second(2));

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(pool.stats().counters.health_replacements, 1);

    pool.release(lease.id()).unwrap();
    assert!(pool.release(lease.id()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unreleased_lease_of_replaced_entry_is_forgotten_after_idle_threshold() {
    let config = probing_every_second(2).with_idle_threshold(Duration::from_secs(10));
    let (pool, factory) = mock_pool(config);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(pool.stats().counters.health_replacements, 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    pool.reclaim_idle();

    let err = pool.release(lease.id()).unwrap_err();
    assert!(matches!(err, PoolError::UnknownLease(id) if id == lease.id()));
}

#[tokio::test(start_paused = true)]
async fn test_error_entry_gives_up_its_slot_to_another_key() {
    let (pool, factory) = mock_pool(probing_every_second(3).with_max_connections(1));
    let mut events = pool.subscribe();

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.stats().entries[0].status, EntryStatus::Error);

    let lease = pool
        .acquire(IMAGE_ANALYSIS, &ModelConfig::default(), Duration::from_millis(900))
        .await
        .unwrap();
    assert_eq!(lease.handle().id, 2);
    assert_eq!(lease.model_type(), IMAGE_ANALYSIS);

    let stats = pool.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.count(EntryStatus::Error), 0);
    assert_eq!(stats.counters.evictions, 0);

    let reasons: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            PoolEvent::EntryRemoved { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![RemovalReason::Stale]);
}

#[tokio::test(start_paused = true)]
async fn test_released_error_entry_makes_room_for_queued_request() {
    let (pool, factory) = mock_pool(probing_every_second(3).with_max_connections(1));

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(IMAGE_ANALYSIS, &ModelConfig::default(), WAIT).await })
    };
    eventually("request queued", || pool.stats().queued == 1).await;

    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.stats().entries[0].status, EntryStatus::Error);

    pool.release(lease.id()).unwrap();
    let served = queued.await.unwrap().unwrap();
    assert_eq!(served.handle().id, 2);
    assert_eq!(served.model_type(), IMAGE_ANALYSIS);
    assert_eq!(pool.stats().active, 1);
    assert_eq!(pool.stats().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slot_freed_by_replacement_serves_queued_request_first() {
    let (pool, factory) = mock_pool(probing_every_second(2).with_max_connections(1));

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(IMAGE_ANALYSIS, &ModelConfig::default(), WAIT).await })
    };
    eventually("request queued", || pool.stats().queued == 1).await;

    factory.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let served = queued.await.unwrap().unwrap();
    assert_eq!(served.handle().id, 2);
    assert_eq!(served.model_type(), IMAGE_ANALYSIS);

    let stats = pool.stats();
    assert_eq!(stats.counters.health_replacements, 1);
    assert_eq!(stats.active, 1);
    assert_eq!(factory.create_calls(), 2, "no restock while the pool is full");

    pool.release(lease.id()).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_is_degraded_but_usable() {
    let config = probing_every_second(3).with_degraded_latency(Duration::from_millis(100));
    let (pool, factory) = mock_pool(config);

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.set_probe_delay(Duration::from_millis(300));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let entry = pool.stats().entries[0].clone();
    assert_eq!(entry.health, HealthState::Degraded);
    assert_eq!(entry.status, EntryStatus::Ready);
    assert_eq!(entry.consecutive_errors, 0);
    assert!(entry.last_probe_latency_ms.unwrap_or_default() >= 300);
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_counts_as_failure() {
    let config = probing_every_second(3).with_probe_timeout(Duration::from_millis(200));
    let (pool, factory) = mock_pool(config);

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    factory.set_probe_delay(Duration::from_secs(10));
    eventually("probe timed out", || pool.stats().entries[0].consecutive_errors == 1).await;

    assert_eq!(pool.stats().entries[0].health, HealthState::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn test_per_model_health_interval_override() {
    let (pool, factory) = mock_pool(PoolConfig::default());
    let config = flash().with_health_check_interval(Duration::from_millis(500));

    pool.preload(TEXT_GENERATION, &config, WAIT).await.unwrap();
    let after_construction = factory.probe_calls();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(factory.probe_calls() - after_construction, 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_are_reclaimed() {
    let config = PoolConfig::default()
        .with_idle_threshold(Duration::from_secs(10))
        .with_idle_sweep_interval(Duration::from_secs(5));
    let (pool, factory) = mock_pool(config);

    pool.preload(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_secs(16)).await;

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.counters.idle_reclaimed, 1);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    assert_eq!(lease.handle().id, 2);
    assert_eq!(pool.stats().counters.created, 2);
    assert_eq!(factory.create_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_entries_are_never_reclaimed() {
    let config = PoolConfig::default()
        .with_idle_threshold(Duration::from_secs(10))
        .with_idle_sweep_interval(Duration::from_secs(5));
    let (pool, _factory) = mock_pool(config);

    let lease = pool.acquire(TEXT_GENERATION, &flash(), WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.reclaim_idle(), 0);
    assert_eq!(pool.stats().active, 1);

    pool.release(lease.id()).unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(pool.reclaim_idle(), 1);
    assert_eq!(pool.stats().active, 0);
}
