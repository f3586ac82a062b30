use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::backend::StateBackend;
use super::models::ReleaseTargetKey;
use crate::error::EngineError;

/// Lease-backed advisory lock, one per release target.
///
/// Waiters in the same process queue on an async mutex first, so only one of
/// them polls the store at a time. Across processes the `leases` table decides.
pub struct ReleaseTargetMutex {
    backend: Arc<dyn StateBackend>,
    local: LocalLocks,
    holder_id: String,
    ttl: Duration,
    poll_interval: Duration,
}

type LocalLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// A held lease. Call [`LeaseGuard::release`] when done.
pub struct LeaseGuard {
    backend: Arc<dyn StateBackend>,
    key: String,
    holder: String,
    lost: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
    locals: LocalLocks,
    local: Option<OwnedMutexGuard<()>>,
}

impl ReleaseTargetMutex {
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            backend,
            local: Arc::new(DashMap::new()),
            holder_id: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
            ttl,
            poll_interval,
        }
    }

    /// Wait until the target's lease is ours.
    pub async fn acquire(&self, key: &ReleaseTargetKey) -> Result<LeaseGuard> {
        let lock_key = key.lock_key();
        let local = self
            .local
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let local_guard = local.lock_owned().await;

        let holder = format!("{}:{}", self.holder_id, uuid::Uuid::new_v4());
        let mut delay = self.poll_interval;
        loop {
            if self
                .backend
                .try_acquire_lease(&lock_key, &holder, self.ttl)
                .await?
                .is_some()
            {
                break;
            }
            tracing::debug!(lock = %lock_key, "lease held elsewhere, waiting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.ttl / 2).max(self.poll_interval);
        }

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = spawn_renewal(
            self.backend.clone(),
            lock_key.clone(),
            holder.clone(),
            self.ttl,
            lost.clone(),
        );

        Ok(LeaseGuard {
            backend: self.backend.clone(),
            key: lock_key,
            holder,
            lost,
            renewal,
            locals: self.local.clone(),
            local: Some(local_guard),
        })
    }

    /// Targets with an in-process lock currently allocated.
    pub fn tracked(&self) -> usize {
        self.local.len()
    }

    /// Run `f` while holding the target's lease. The lease is released whether
    /// or not `f` succeeds.
    pub async fn run_exclusive<F, Fut, T>(&self, key: &ReleaseTargetKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key).await?;
        let result = f().await;
        let lost = guard.is_lost();
        let released = guard.release().await;

        let value = result?;
        released?;
        if lost {
            return Err(EngineError::LeaseLost(key.lock_key()).into());
        }
        Ok(value)
    }
}

fn spawn_renewal(
    backend: Arc<dyn StateBackend>,
    key: String,
    holder: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (ttl / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(period).await;
            match backend.renew_lease(&key, &holder, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(lock = %key, "lease expired before renewal");
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    tracing::warn!(lock = %key, error = %e, "lease renewal failed");
                }
            }
        }
    })
}

impl LeaseGuard {
    /// True once a renewal found the lease taken over.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn release(self) -> Result<()> {
        self.renewal.abort();
        self.backend.release_lease(&self.key, &self.holder).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        drop(self.local.take());
        // Only the map's own handle left means nobody is waiting.
        self.locals
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
