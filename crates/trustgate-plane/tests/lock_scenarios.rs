//! Distributed Lock Scenario Tests
//!
//! Two "instances" are modelled as two lock managers with their own breakers
//! sharing one coordination store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::FlakyStore;
use trustgate_core::{BreakerConfig, ErrorClass, GateError, LockConfig};
use trustgate_plane::{CircuitBreaker, CoordinationStore, LockManager, MemoryStore};

// =============================================================================
// Test Helpers
// =============================================================================

fn instance(store: Arc<dyn CoordinationStore>) -> LockManager {
    let breaker = Arc::new(CircuitBreaker::new("coordination-store", BreakerConfig::default()).unwrap());
    LockManager::new(store, breaker, LockConfig::default())
}

fn counting_callback() -> (Arc<AtomicUsize>, trustgate_plane::LockLostCallback) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let callback: trustgate_plane::LockLostCallback = Arc::new(move |_name: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (fired, callback)
}

// =============================================================================
// SCENARIO: Contention between instances
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_job_42_handover() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());
    let b = instance(store.clone());
    let ttl = Duration::from_millis(5_000);
    let heartbeat = Duration::from_millis(1_000);

    let lock_a = a.lock_with("job:42", ttl, heartbeat, None);
    let lock_b = b.lock_with("job:42", ttl, heartbeat, None);

    lock_a.acquire().await.unwrap();

    let err = lock_b.acquire().await.unwrap_err();
    assert_eq!(err, GateError::LockAlreadyHeld("job:42".into()));
    assert_eq!(err.class(), ErrorClass::Contention);

    lock_a.release().await;
    lock_b.acquire().await.unwrap();
    assert_eq!(
        store.get("lock:job:42").await.unwrap(),
        lock_b.owner_id()
    );
    lock_b.release().await;
}

/// The heartbeat keeps the lease alive well past its original TTL
#[tokio::test(start_paused = true)]
async fn scenario_heartbeat_outlives_ttl() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());
    let b = instance(store.clone());

    let lock = a.lock_with(
        "job:long",
        Duration::from_millis(500),
        Duration::from_millis(200),
        None,
    );
    lock.acquire().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(lock.is_held());
    assert_eq!(store.get("lock:job:long").await.unwrap(), lock.owner_id());
    assert!(matches!(
        b.lock("job:long").acquire().await,
        Err(GateError::LockAlreadyHeld(_))
    ));
    lock.release().await;
}

/// A holder that crashed without releasing is cleared by TTL expiry
#[tokio::test(start_paused = true)]
async fn scenario_crashed_holder_expires() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());
    let b = instance(store.clone());

    let crashed = a.lock_with("job:crash", Duration::from_millis(500), Duration::from_millis(200), None);
    crashed.acquire().await.unwrap();
    // Dropping stops the heartbeat without deleting the record
    drop(crashed);

    assert!(b.lock("job:crash").acquire().await.is_err());
    tokio::time::sleep(Duration::from_millis(600)).await;

    let successor = b.lock("job:crash");
    successor.acquire().await.unwrap();
    successor.release().await;
}

// =============================================================================
// SCENARIO: Ownership is verified on release
// =============================================================================

#[tokio::test]
async fn scenario_non_owner_release_is_noop() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());

    let lock = a.lock("job:7");
    lock.acquire().await.unwrap();

    // Another owner took over the record
    store.insert("lock:job:7", "intruder", Duration::from_secs(5));

    lock.release().await;
    assert_eq!(
        store.get("lock:job:7").await.unwrap().as_deref(),
        Some("intruder")
    );
}

#[tokio::test]
async fn scenario_release_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());

    let lock = a.lock("job:8");
    lock.release().await;
    lock.acquire().await.unwrap();
    lock.release().await;
    lock.release().await;
    assert!(store.is_empty());
}

// =============================================================================
// SCENARIO: Heartbeat detects loss
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_owner_mismatch_fires_callback_once() {
    let store = FlakyStore::new();
    let a = instance(store.clone());
    let (fired, callback) = counting_callback();

    let lock = a.lock_with(
        "job:9",
        Duration::from_millis(1_000),
        Duration::from_millis(100),
        Some(callback),
    );
    lock.acquire().await.unwrap();

    store
        .inner
        .insert("lock:job:9", "intruder", Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!lock.is_held());
    assert_eq!(lock.ensure_held(), Err(GateError::LockLost("job:9".into())));

    // No further heartbeats after loss
    let calls = store.calls();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.calls(), calls);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    lock.release().await;
    assert_eq!(
        store.inner.get("lock:job:9").await.unwrap().as_deref(),
        Some("intruder")
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_store_error_is_treated_as_loss() {
    let store = FlakyStore::new();
    let a = instance(store.clone());
    let (fired, callback) = counting_callback();

    let lock = a.lock_with(
        "job:10",
        Duration::from_millis(1_000),
        Duration::from_millis(100),
        Some(callback),
    );
    lock.acquire().await.unwrap();

    store.set_failing(true);
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!lock.is_held());
}

#[tokio::test(start_paused = true)]
async fn scenario_explicit_release_does_not_fire_callback() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());
    let (fired, callback) = counting_callback();

    let lock = a.lock_with(
        "job:11",
        Duration::from_millis(1_000),
        Duration::from_millis(100),
        Some(callback),
    );
    lock.acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    lock.release().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

// =============================================================================
// SCENARIO: with_lock releases on every exit path
// =============================================================================

#[tokio::test]
async fn scenario_with_lock_returns_value_and_releases() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());

    let observed = a
        .with_lock("job:12", || {
            let store = store.clone();
            async move { store.get("lock:job:12").await.unwrap().is_some() }
        })
        .await
        .unwrap();

    assert!(observed);
    assert!(store.is_empty());
}

#[tokio::test]
async fn scenario_with_lock_releases_on_error() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());

    let outcome = a
        .with_lock("job:13", || async { Err::<(), _>("job failed") })
        .await
        .unwrap();

    assert_eq!(outcome, Err("job failed"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn scenario_with_lock_releases_on_panic() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());

    let handle = tokio::spawn(async move {
        a.with_lock("job:14", || async {
            if store_is_poisoned() {
                panic!("job crashed");
            }
            42
        })
        .await
    });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());
    assert!(store.get("lock:job:14").await.unwrap().is_none());
}

fn store_is_poisoned() -> bool {
    true
}

#[tokio::test]
async fn scenario_with_lock_contended_does_not_run() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(store.clone());
    let b = instance(store.clone());

    let held = a.lock("job:15");
    held.acquire().await.unwrap();

    let ran = AtomicUsize::new(0);
    let result = b
        .with_lock("job:15", || async {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert!(matches!(result, Err(GateError::LockAlreadyHeld(_))));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    held.release().await;
}

// =============================================================================
// SCENARIO: Misconfigured lease timings
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_zero_heartbeat_refused_before_store() {
    let store = FlakyStore::new();
    let a = instance(store.clone());
    let (fired, callback) = counting_callback();
    let lock = a.lock_with(
        "job:z",
        Duration::from_millis(500),
        Duration::ZERO,
        Some(callback),
    );

    let err = lock.acquire().await.unwrap_err();
    assert!(matches!(err, GateError::Config(_)), "got {err:?}");
    assert!(!lock.is_held());
    assert_eq!(store.calls(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.inner.get("lock:job:z").await.unwrap().is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scenario_invalid_timings_do_not_trip_breaker() {
    let store = FlakyStore::new();
    let breaker = Arc::new(CircuitBreaker::new(
        "coordination-store",
        BreakerConfig::new(1, Duration::from_secs(30), 1),
    )
    .unwrap());
    let locks = LockManager::new(store.clone(), breaker.clone(), LockConfig::default());

    let cases = [
        (Duration::ZERO, Duration::ZERO),
        (Duration::ZERO, Duration::from_millis(100)),
        (Duration::from_millis(500), Duration::from_millis(500)),
        (Duration::from_millis(500), Duration::from_secs(1)),
    ];
    for (ttl, heartbeat) in cases {
        let result = locks.lock_with("job:cfg", ttl, heartbeat, None).acquire().await;
        assert!(matches!(result, Err(GateError::Config(_))), "ttl={ttl:?} heartbeat={heartbeat:?}");
    }

    assert_eq!(store.calls(), 0);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.state(), trustgate_plane::BreakerState::Closed);

    let lock = locks.lock("job:cfg");
    lock.acquire().await.unwrap();
    lock.release().await;
}

// =============================================================================
// SCENARIO: Half-open probe budget
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_acquire_during_busy_probe_is_rejected() {
    let store = FlakyStore::new();
    let breaker = Arc::new(CircuitBreaker::new(
        "coordination-store",
        BreakerConfig::new(1, Duration::from_millis(100), 1),
    )
    .unwrap());
    let locks = LockManager::new(store.clone(), breaker.clone(), LockConfig::default());

    store.set_failing(true);
    assert!(locks.lock("job:16").acquire().await.is_err());
    store.set_failing(false);
    tokio::time::advance(Duration::from_millis(100)).await;

    // Occupy the only probe slot
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let probe = {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    let err = locks.lock("job:16").acquire().await.unwrap_err();
    assert_eq!(err, GateError::LockProbeExhausted("job:16".into()));
    assert_eq!(err.class(), ErrorClass::Availability);

    release_tx.send(()).unwrap();
    probe.await.unwrap().unwrap();

    let lock = locks.lock("job:16");
    lock.acquire().await.unwrap();
    lock.release().await;
}
