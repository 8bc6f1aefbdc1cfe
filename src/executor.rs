//! Mirror executor: issues `CREATE MIRROR` / `DROP MIRROR` against the replicator's
//! SQL endpoint, wrapped in a circuit breaker and a retry-with-backoff policy.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::event::{MirrorOp, MirrorRequest};
use crate::retry::RetryPolicy;
use crate::{Backoff, Jitter, ResilienceError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicatorError {
    #[error("replicator query failed: {0}")]
    Query(String),
    #[error("replicator query timed out")]
    Timeout,
}

/// Thin seam over the replicator's SQL endpoint so tests can substitute a fake
/// without a live PeerDB instance.
#[async_trait]
pub trait ReplicatorClient: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<(), ReplicatorError>;
}

/// Production client: the replicator speaks the Postgres wire protocol, so we talk to
/// it with the same driver used for the source connection.
pub struct PgReplicatorClient {
    client: tokio_postgres::Client,
    query_timeout: Duration,
}

impl PgReplicatorClient {
    pub fn new(client: tokio_postgres::Client, query_timeout: Duration) -> Self {
        Self { client, query_timeout }
    }
}

#[async_trait]
impl ReplicatorClient for PgReplicatorClient {
    async fn execute(&self, sql: &str) -> Result<(), ReplicatorError> {
        match tokio::time::timeout(self.query_timeout, self.client.batch_execute(sql)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ReplicatorError::Query(e.to_string())),
            Err(_) => Err(ReplicatorError::Timeout),
        }
    }
}

/// Outcome of a single executor call, distinguishing a genuinely new mirror from one
/// that was already (or already not) in the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    AlreadyInDesiredState,
}

fn is_idempotent_conflict(op: MirrorOp, message: &str) -> bool {
    let lower = message.to_lowercase();
    match op {
        MirrorOp::Create => lower.contains("already exists"),
        MirrorOp::Drop => lower.contains("does not exist") || lower.contains("must acquire"),
    }
}

/// A single retry policy is shared between `create` and `drop`, so this can't take a
/// `MirrorOp` to narrow the check; instead it treats a message matching *either* op's
/// idempotent-conflict shape as non-retryable. The two shapes don't overlap in practice.
pub(crate) fn is_retryable_replicator_error(error: &ReplicatorError) -> bool {
    match error {
        ReplicatorError::Timeout => true,
        ReplicatorError::Query(msg) => {
            !is_idempotent_conflict(MirrorOp::Create, msg) && !is_idempotent_conflict(MirrorOp::Drop, msg)
        }
    }
}

pub struct MirrorExecutor<C: ReplicatorClient> {
    client: Arc<C>,
    breaker: CircuitBreakerPolicy,
    // pub(crate) so other modules' test fixtures can swap in a fast, jitter-free retry
    // policy without waiting out real backoff delays.
    pub(crate) retry: RetryPolicy<ReplicatorError>,
    source_peer: String,
    target_peer: String,
}

impl<C: ReplicatorClient + 'static> MirrorExecutor<C> {
    pub fn new(
        client: Arc<C>,
        breaker: CircuitBreakerPolicy,
        max_retries: usize,
        retry_delay: Duration,
        retry_backoff: f64,
        source_peer: String,
        target_peer: String,
    ) -> Self {
        let retry = RetryPolicy::builder()
            .max_attempts(max_retries + 1)
            .expect("max_retries + 1 is always >= 1")
            .backoff(Backoff::exponential_with_multiplier(retry_delay, retry_backoff))
            .with_jitter(Jitter::full())
            .should_retry(is_retryable_replicator_error)
            .build();

        Self { client, breaker, retry, source_peer, target_peer }
    }

    fn create_sql(&self, request: &MirrorRequest) -> String {
        format!(
            "CREATE MIRROR {mirror} FROM {source} TO {target} WITH TABLE MAPPING ({schema}.{table}:{table}) WITH (do_initial_copy = true);",
            mirror = request.mirror_name,
            source = self.source_peer,
            target = self.target_peer,
            schema = request.schema,
            table = request.table,
        )
    }

    fn drop_sql(&self, request: &MirrorRequest) -> String {
        format!("DROP MIRROR {};", request.mirror_name)
    }

    pub async fn apply(&self, request: &MirrorRequest) -> Result<Outcome, ReplicatorError> {
        match request.op {
            MirrorOp::Create => self.create(request).await,
            MirrorOp::Drop => self.drop(request).await,
        }
    }

    async fn create(&self, request: &MirrorRequest) -> Result<Outcome, ReplicatorError> {
        let sql = self.create_sql(request);
        let result = self
            .retry
            .execute(|| {
                let sql = sql.clone();
                let client = self.client.clone();
                let breaker = self.breaker.clone();
                async move {
                    breaker
                        .execute(|| {
                            let sql = sql.clone();
                            let client = client.clone();
                            async move { client.execute(&sql).await.map_err(ResilienceError::Inner) }
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(()) => Ok(Outcome::Applied),
            Err(ResilienceError::Inner(ReplicatorError::Query(msg))) if is_idempotent_conflict(MirrorOp::Create, &msg) => {
                Ok(Outcome::AlreadyInDesiredState)
            }
            Err(ResilienceError::RetryExhausted { failures, .. }) => {
                if let Some(ReplicatorError::Query(msg)) = failures.last() {
                    if is_idempotent_conflict(MirrorOp::Create, msg) {
                        return Ok(Outcome::AlreadyInDesiredState);
                    }
                }
                Err(failures.into_iter().last().unwrap_or(ReplicatorError::Timeout))
            }
            Err(ResilienceError::Inner(e)) => Err(e),
            Err(ResilienceError::CircuitOpen { .. }) => Err(ReplicatorError::Query("circuit open".to_string())),
            Err(other) => Err(ReplicatorError::Query(other.to_string())),
        }
    }

    async fn drop(&self, request: &MirrorRequest) -> Result<Outcome, ReplicatorError> {
        let sql = self.drop_sql(request);
        let result = self
            .retry
            .execute(|| {
                let sql = sql.clone();
                let client = self.client.clone();
                let breaker = self.breaker.clone();
                async move {
                    breaker
                        .execute(|| {
                            let sql = sql.clone();
                            let client = client.clone();
                            async move { client.execute(&sql).await.map_err(ResilienceError::Inner) }
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(()) => Ok(Outcome::Applied),
            Err(ResilienceError::Inner(ReplicatorError::Query(msg))) if is_idempotent_conflict(MirrorOp::Drop, &msg) => {
                Ok(Outcome::AlreadyInDesiredState)
            }
            Err(ResilienceError::RetryExhausted { failures, .. }) => {
                if let Some(ReplicatorError::Query(msg)) = failures.last() {
                    if is_idempotent_conflict(MirrorOp::Drop, msg) {
                        return Ok(Outcome::AlreadyInDesiredState);
                    }
                }
                Err(failures.into_iter().last().unwrap_or(ReplicatorError::Timeout))
            }
            // A drop that cannot reach the replicator must not block table-deletion
            // DDL on replicator health; the next reconciliation opportunity retries it.
            Err(ResilienceError::CircuitOpen { .. }) => Ok(Outcome::AlreadyInDesiredState),
            Err(ResilienceError::Inner(e)) => Err(e),
            Err(other) => Err(ReplicatorError::Query(other.to_string())),
        }
    }
}
