//! Consistency verifier: compares row counts between Postgres and ClickHouse after a
//! mirror is created, and periodically for the full configured table set.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::stats::ConsistencyReport;
use crate::ResilienceError;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    #[error("source count query failed: {0}")]
    Source(String),
    #[error("target count query failed: {0}")]
    Target(String),
}

/// Row-count lookup against the source (Postgres). One implementation wraps a pooled
/// `tokio_postgres::Client`; a fake backs the unit tests below.
#[async_trait]
pub trait SourceCounter: Send + Sync {
    async fn count(&self, schema: &str, table: &str) -> Result<i64, VerifierError>;
}

/// Row-count lookup against the target (ClickHouse). Tries the bare table name first,
/// then falls back to `postgres.<table>` — a pragmatic compatibility shim for
/// deployments that mirror into a `postgres` source-namespaced database.
#[async_trait]
pub trait TargetCounter: Send + Sync {
    async fn count(&self, table: &str) -> Result<i64, VerifierError>;
}

pub struct ConsistencyVerifier<S: SourceCounter, T: TargetCounter> {
    source: S,
    target: T,
    breaker: CircuitBreakerPolicy,
    lag_retry_delay: Duration,
    lag_retry_attempts: usize,
}

impl<S: SourceCounter, T: TargetCounter> ConsistencyVerifier<S, T> {
    pub fn new(source: S, target: T, breaker: CircuitBreakerPolicy) -> Self {
        Self { source, target, breaker, lag_retry_delay: Duration::from_secs(10), lag_retry_attempts: 3 }
    }

    #[cfg(test)]
    fn with_lag_retry(mut self, delay: Duration, attempts: usize) -> Self {
        self.lag_retry_delay = delay;
        self.lag_retry_attempts = attempts;
        self
    }

    async fn target_count(&self, table: &str) -> Result<i64, VerifierError> {
        match self.target.count(table).await {
            Ok(count) => Ok(count),
            Err(_) => self.target.count(&format!("postgres.{table}")).await,
        }
    }

    /// Compare row counts for one `(schema, table)` pair, retrying up to
    /// `lag_retry_attempts` times (spaced `lag_retry_delay` apart) to tolerate
    /// replication lag before reporting a genuine mismatch.
    pub async fn check(&self, schema: &str, table: &str) -> Result<ConsistencyReport, VerifierError> {
        let mut last_report = None;

        for attempt in 0..self.lag_retry_attempts {
            let pg_count = self
                .breaker
                .execute(|| async { self.source.count(schema, table).await.map_err(ResilienceError::Inner) })
                .await
                .map_err(|e| match e {
                    ResilienceError::Inner(inner) => inner,
                    other => VerifierError::Source(other.to_string()),
                })?;

            let ch_count = self.target_count(table).await?;

            let report = ConsistencyReport {
                schema: schema.to_string(),
                table: table.to_string(),
                pg_count,
                ch_count,
                difference: (pg_count - ch_count).abs(),
                matched: pg_count == ch_count,
            };

            if report.matched {
                return Ok(report);
            }

            last_report = Some(report);

            if attempt + 1 < self.lag_retry_attempts {
                tokio::time::sleep(self.lag_retry_delay).await;
            }
        }

        Ok(last_report.expect("lag_retry_attempts is always >= 1"))
    }
}
