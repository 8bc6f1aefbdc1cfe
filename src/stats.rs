//! Process-local aggregate statistics exposed by the health surface.

use crate::circuit_breaker::CircuitState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub schema: String,
    pub table: String,
    pub pg_count: i64,
    pub ch_count: i64,
    pub difference: i64,
    pub matched: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
struct Inner {
    last_error: Option<String>,
    last_notification_at: Option<chrono::DateTime<chrono::Utc>>,
    last_consistency_report: Option<ConsistencyReport>,
}

/// Counters updated under atomics, plus a small mutex-guarded block for the handful
/// of fields that aren't simple monotonic counts. Mirrors the shared-resource policy:
/// mutate only through accessor methods, never reach into fields directly.
#[derive(Debug)]
pub struct AggregateStats {
    worker_id: String,
    mirrors_created: AtomicU64,
    mirrors_failed: AtomicU64,
    notifications_processed: AtomicU64,
    notifications_deduplicated: AtomicU64,
    inner: Mutex<Inner>,
}

impl AggregateStats {
    pub fn new(worker_id: String) -> Self {
        Self {
            worker_id,
            mirrors_created: AtomicU64::new(0),
            mirrors_failed: AtomicU64::new(0),
            notifications_processed: AtomicU64::new(0),
            notifications_deduplicated: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record_mirror_created(&self) {
        self.mirrors_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_failed(&self, error: impl Into<String>) {
        self.mirrors_failed.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(error);
    }

    pub fn record_notification_processed(&self) {
        self.notifications_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().expect("stats mutex poisoned").last_notification_at = Some(chrono::Utc::now());
    }

    pub fn record_notification_deduplicated(&self) {
        self.notifications_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        self.inner.lock().expect("stats mutex poisoned").last_error = Some(error.into());
    }

    pub fn record_consistency_report(&self, report: ConsistencyReport) {
        if !report.matched {
            self.set_last_error(format!(
                "consistency mismatch {}.{}: pg={} ch={} diff={}",
                report.schema, report.table, report.pg_count, report.ch_count, report.difference
            ));
        }
        self.inner.lock().expect("stats mutex poisoned").last_consistency_report = Some(report);
    }

    pub fn snapshot(
        &self,
        is_leader: bool,
        connected: bool,
        replicator_breaker_state: CircuitState,
        postgres_breaker_state: CircuitState,
    ) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats mutex poisoned").clone();
        StatsSnapshot {
            worker_id: self.worker_id.clone(),
            is_leader,
            connected,
            mirrors_created: self.mirrors_created.load(Ordering::Relaxed),
            mirrors_failed: self.mirrors_failed.load(Ordering::Relaxed),
            notifications_processed: self.notifications_processed.load(Ordering::Relaxed),
            notifications_deduplicated: self.notifications_deduplicated.load(Ordering::Relaxed),
            last_notification_at: inner.last_notification_at,
            last_error: inner.last_error,
            last_consistency_report: inner.last_consistency_report,
            replicator_breaker_state: format!("{:?}", replicator_breaker_state),
            postgres_breaker_state: format!("{:?}", postgres_breaker_state),
        }
    }
}

/// Point-in-time rendering of [`AggregateStats`] for `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub worker_id: String,
    pub is_leader: bool,
    pub connected: bool,
    pub mirrors_created: u64,
    pub mirrors_failed: u64,
    pub notifications_processed: u64,
    pub notifications_deduplicated: u64,
    pub last_notification_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub last_consistency_report: Option<ConsistencyReport>,
    pub replicator_breaker_state: String,
    pub postgres_breaker_state: String,
}
