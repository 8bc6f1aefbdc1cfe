//! Leader election: a Redis-backed TTL lease ensuring at most one active reconciler.
//!
//! Grounded in the original worker's leader-election script, hardened where that
//! script had a race: release there was a plain GET-then-DEL (a TOCTOU window against
//! a concurrent successor's acquisition); here it is a single compare-and-delete via
//! [`KvStore::delete_if_match`].

use crate::kv::KvStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOCK_KEY: &str = "echodb:auto_mirror:leader_lock";

/// Type-erased leadership check, so the health surface doesn't need to know the
/// concrete [`KvStore`] backing a [`LeaderElection`].
pub trait LeaderStatus: Send + Sync {
    fn is_leader(&self) -> bool;
}

impl<S: KvStore + 'static> LeaderStatus for LeaderElection<S> {
    fn is_leader(&self) -> bool {
        LeaderElection::is_leader(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaderError<E: std::error::Error + Send + Sync + 'static> {
    #[error("key/value store error: {0}")]
    Store(#[source] E),
}

/// Holds the local view of leadership and drives a background heartbeat task once
/// acquired. Cheap to clone; all clones observe the same [`AtomicBool`].
pub struct LeaderElection<S: KvStore + 'static> {
    store: Arc<S>,
    worker_id: String,
    ttl: Duration,
    is_leader: Arc<AtomicBool>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    // Replaced with a fresh token on every acquisition: a `CancellationToken` cannot be
    // un-cancelled, and this election may acquire, release, and re-acquire many times
    // over the process lifetime (each follower → leader cycle in the reconciler loop).
    shutdown: std::sync::Mutex<CancellationToken>,
}

impl<S: KvStore + 'static> LeaderElection<S> {
    pub fn new(store: Arc<S>, worker_id: String, ttl: Duration) -> Self {
        Self {
            store,
            worker_id,
            ttl,
            is_leader: Arc::new(AtomicBool::new(false)),
            heartbeat_handle: std::sync::Mutex::new(None),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.store.get(LOCK_KEY).await.unwrap_or(None)
    }

    /// Attempt to acquire the lease. On success, spawns the renewal heartbeat and
    /// returns `true`. Idempotent: calling again while already leader is a no-op.
    pub async fn try_acquire(&self) -> Result<bool, LeaderError<S::Error>> {
        if self.is_leader() {
            return Ok(true);
        }

        let acquired = self
            .store
            .set_nx_ex(LOCK_KEY, &self.worker_id, self.ttl)
            .await
            .map_err(LeaderError::Store)?;

        if acquired {
            self.is_leader.store(true, Ordering::Release);
            self.spawn_heartbeat();
            tracing::info!(worker_id = %self.worker_id, "acquired leadership");
        } else {
            let current = self.current_leader().await;
            tracing::debug!(worker_id = %self.worker_id, current_leader = ?current, "leadership not acquired");
        }

        Ok(acquired)
    }

    fn spawn_heartbeat(&self) {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let ttl = self.ttl;
        let is_leader = self.is_leader.clone();
        let fresh_token = CancellationToken::new();
        *self.shutdown.lock().expect("leader shutdown token mutex poisoned") = fresh_token.clone();
        let shutdown = fresh_token;
        let interval = ttl / 2;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match store.get(LOCK_KEY).await {
                    Ok(Some(ref current)) if current == &worker_id => {
                        if let Err(e) = store.expire(LOCK_KEY, ttl).await {
                            tracing::warn!(error = %e, "heartbeat: failed to renew lease, surrendering");
                            is_leader.store(false, Ordering::Release);
                            break;
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(worker_id = %worker_id, current_leader = ?other, "heartbeat: lost leadership");
                        is_leader.store(false, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "heartbeat: store error, surrendering");
                        is_leader.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        });

        *self.heartbeat_handle.lock().expect("heartbeat handle mutex poisoned") = Some(handle);
    }

    /// Release the lease (compare-and-delete) and stop the heartbeat. Safe to call
    /// whether or not this worker currently holds leadership.
    pub async fn release(&self) {
        self.shutdown.lock().expect("leader shutdown token mutex poisoned").cancel();
        if let Some(handle) = self.heartbeat_handle.lock().expect("heartbeat handle mutex poisoned").take() {
            handle.abort();
        }

        if self.is_leader.swap(false, Ordering::AcqRel) {
            match self.store.delete_if_match(LOCK_KEY, &self.worker_id).await {
                Ok(true) => tracing::info!(worker_id = %self.worker_id, "released leadership"),
                Ok(false) => tracing::debug!(worker_id = %self.worker_id, "lease already reassigned, nothing to release"),
                Err(e) => tracing::warn!(error = %e, "failed to release lease"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn try_acquire_succeeds_when_key_absent() {
        let store = Arc::new(InMemoryKvStore::new());
        let election = LeaderElection::new(store, "worker-1".to_string(), Duration::from_secs(30));
        assert!(election.try_acquire().await.unwrap());
        assert!(election.is_leader());
        election.release().await;
    }

    #[tokio::test]
    async fn second_worker_cannot_acquire_while_first_holds_lease() {
        let store = Arc::new(InMemoryKvStore::new());
        let a = LeaderElection::new(store.clone(), "worker-a".to_string(), Duration::from_secs(30));
        let b = LeaderElection::new(store, "worker-b".to_string(), Duration::from_secs(30));

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(!b.is_leader());
        a.release().await;
    }

    #[tokio::test]
    async fn release_is_a_compare_and_delete() {
        let store = Arc::new(InMemoryKvStore::new());
        let a = LeaderElection::new(store.clone(), "worker-a".to_string(), Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());

        // Simulate the key having already been reassigned to someone else (e.g. the
        // lease expired and a successor acquired it) before this release runs.
        store.set_ex(LOCK_KEY, "worker-c", Duration::from_secs(30)).await.unwrap();
        a.release().await;

        // Because the value no longer matched worker-a, the successor's lease survives.
        assert_eq!(store.get(LOCK_KEY).await.unwrap(), Some("worker-c".to_string()));
    }

    #[tokio::test]
    async fn current_leader_reflects_store_value() {
        let store = Arc::new(InMemoryKvStore::new());
        let a = LeaderElection::new(store, "worker-a".to_string(), Duration::from_secs(30));
        assert_eq!(a.current_leader().await, None);
        a.try_acquire().await.unwrap();
        assert_eq!(a.current_leader().await, Some("worker-a".to_string()));
        a.release().await;
    }

    #[tokio::test]
    async fn try_acquire_is_idempotent_for_current_leader() {
        let store = Arc::new(InMemoryKvStore::new());
        let a = LeaderElection::new(store, "worker-a".to_string(), Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());
        assert!(a.try_acquire().await.unwrap());
        a.release().await;
    }
}
