use anyhow::bail;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use stagehand::state::models::ReleaseTargetKey;
use stagehand::state::{ReleaseTargetMutex, SqliteBackend, StateBackend};

async fn memory_backend() -> Arc<dyn StateBackend> {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    Arc::new(backend)
}

fn mutex(backend: &Arc<dyn StateBackend>) -> Arc<ReleaseTargetMutex> {
    Arc::new(ReleaseTargetMutex::new(
        backend.clone(),
        Duration::from_secs(5),
        Duration::from_millis(5),
    ))
}

fn key() -> ReleaseTargetKey {
    ReleaseTargetKey::new("res", "env", "dep")
}

#[tokio::test]
async fn test_holders_never_overlap() {
    let backend = memory_backend().await;
    // Two instances stand in for two processes sharing one store.
    let mutexes = [mutex(&backend), mutex(&backend)];
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for i in 0..8 {
        let mutex = mutexes[i % 2].clone();
        let inside = inside.clone();
        let peak = peak.clone();
        set.spawn(async move {
            mutex
                .run_exclusive(&key(), || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idle_local_locks_are_dropped() {
    let backend = memory_backend().await;
    let mutex = mutex(&backend);

    for i in 0..16 {
        let target = ReleaseTargetKey::new("res", "env", &format!("dep-{}", i));
        mutex.run_exclusive(&target, || async { Ok(()) }).await.unwrap();
    }
    assert_eq!(mutex.tracked(), 0);

    // A queued waiter keeps the entry until it is done too.
    let guard = mutex.acquire(&key()).await.unwrap();
    let waiter = {
        let mutex = mutex.clone();
        tokio::spawn(async move { mutex.run_exclusive(&key(), || async { Ok(()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    guard.release().await.unwrap();
    assert_eq!(mutex.tracked(), 1);
    waiter.await.unwrap().unwrap();
    assert_eq!(mutex.tracked(), 0);
}

#[tokio::test]
async fn test_distinct_targets_do_not_block_each_other() {
    let backend = memory_backend().await;
    let mutex = mutex(&backend);
    let other = ReleaseTargetKey::new("res", "env", "other-dep");

    let guard = mutex.acquire(&key()).await.unwrap();
    let value = tokio::time::timeout(
        Duration::from_secs(1),
        mutex.run_exclusive(&other, || async { Ok(7) }),
    )
    .await
    .expect("second target should not wait")
    .unwrap();
    assert_eq!(value, 7);
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_lease_released_after_error() {
    let backend = memory_backend().await;
    let mutex = mutex(&backend);

    let result: anyhow::Result<()> = mutex
        .run_exclusive(&key(), || async { bail!("evaluation failed") })
        .await;
    assert!(result.unwrap_err().to_string().contains("evaluation failed"));

    // Another holder gets it immediately.
    let lease = backend
        .try_acquire_lease(&key().lock_key(), "someone-else", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(lease.is_some());
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let backend = memory_backend().await;
    // A crashed holder that never renews.
    backend
        .try_acquire_lease(&key().lock_key(), "crashed", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();

    let mutex = mutex(&backend);
    let value = tokio::time::timeout(
        Duration::from_secs(2),
        mutex.run_exclusive(&key(), || async { Ok("ran") }),
    )
    .await
    .expect("expired lease should be reclaimed")
    .unwrap();
    assert_eq!(value, "ran");
}
