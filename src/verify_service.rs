//! Glues the [`ConsistencyVerifier`] to the configured schema/table universe, so both the
//! periodic sweep (§4.E) and the on-demand `/verify` endpoint (§4.H) share one code path.

use crate::counters::{CatalogError, TableCatalog};
use crate::stats::{AggregateStats, ConsistencyReport};
use crate::verifier::{ConsistencyVerifier, SourceCounter, TargetCounter, VerifierError};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum VerifyServiceError {
    #[error("verification failed: {0}")]
    Verifier(#[from] VerifierError),
    #[error("catalog lookup failed: {0}")]
    Catalog(#[from] CatalogError),
}

/// Type-erased trigger for the `/verify` endpoint, so [`health`](crate::health) does not
/// need to know the concrete `SourceCounter`/`TargetCounter`/`TableCatalog` types.
#[async_trait]
pub trait VerifyTrigger: Send + Sync {
    async fn verify_one(&self, schema: &str, table: &str) -> Result<ConsistencyReport, VerifyServiceError>;
    async fn verify_all(&self) -> Result<Vec<ConsistencyReport>, VerifyServiceError>;
}

pub struct VerifyService<S: SourceCounter, T: TargetCounter, C: TableCatalog> {
    verifier: ConsistencyVerifier<S, T>,
    catalog: C,
    sync_schemas: Vec<String>,
    excluded_tables: Vec<String>,
    stats: Arc<AggregateStats>,
}

impl<S: SourceCounter, T: TargetCounter, C: TableCatalog> VerifyService<S, T, C> {
    pub fn new(
        verifier: ConsistencyVerifier<S, T>,
        catalog: C,
        sync_schemas: Vec<String>,
        excluded_tables: Vec<String>,
        stats: Arc<AggregateStats>,
    ) -> Self {
        Self { verifier, catalog, sync_schemas, excluded_tables, stats }
    }

    async fn check_and_record(&self, schema: &str, table: &str) -> Result<ConsistencyReport, VerifyServiceError> {
        let report = self.verifier.check(schema, table).await?;
        self.stats.record_consistency_report(report.clone());
        Ok(report)
    }

    /// Runs the periodic sweep: every table in `sync_schemas \ excluded_tables`.
    pub async fn run_sweep(&self) {
        for schema in &self.sync_schemas {
            let tables = match self.catalog.list_tables(schema).await {
                Ok(tables) => tables,
                Err(e) => {
                    tracing::warn!(schema, error = %e, "consistency sweep: failed to list tables");
                    continue;
                }
            };
            for table in tables {
                if self.excluded_tables.contains(&table) {
                    continue;
                }
                match self.check_and_record(schema, &table).await {
                    Ok(report) if !report.matched => {
                        tracing::warn!(schema, table, difference = report.difference, "consistency mismatch");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(schema, table, error = %e, "consistency check failed"),
                }
            }
        }
    }
}

#[async_trait]
impl<S: SourceCounter, T: TargetCounter, C: TableCatalog> VerifyTrigger for VerifyService<S, T, C> {
    async fn verify_one(&self, schema: &str, table: &str) -> Result<ConsistencyReport, VerifyServiceError> {
        self.check_and_record(schema, table).await
    }

    async fn verify_all(&self) -> Result<Vec<ConsistencyReport>, VerifyServiceError> {
        let mut reports = Vec::new();
        for schema in &self.sync_schemas {
            let tables = self.catalog.list_tables(schema).await?;
            for table in tables {
                if self.excluded_tables.contains(&table) {
                    continue;
                }
                reports.push(self.check_and_record(schema, &table).await?);
            }
        }
        Ok(reports)
    }
}
