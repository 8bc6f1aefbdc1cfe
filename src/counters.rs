//! Concrete [`SourceCounter`](crate::verifier::SourceCounter), [`TargetCounter`](crate::verifier::TargetCounter),
//! and catalog-listing implementations against the real Postgres and ClickHouse drivers.
//!
//! Kept separate from [`verifier`](crate::verifier) so that module can stay driver-agnostic
//! and testable against fakes; this module is the only place that issues literal SQL.

use crate::verifier::{SourceCounter, TargetCounter, VerifierError};
use async_trait::async_trait;
use std::time::Duration;

/// Quotes a Postgres identifier, doubling any embedded `"` per the standard escaping rule.
fn quote_pg_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a ClickHouse identifier with backticks, doubling any embedded backtick.
fn quote_ch_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Row-count lookups against the source Postgres database.
pub struct PgSourceCounter {
    client: tokio_postgres::Client,
    query_timeout: Duration,
}

impl PgSourceCounter {
    pub fn new(client: tokio_postgres::Client, query_timeout: Duration) -> Self {
        Self { client, query_timeout }
    }
}

#[async_trait]
impl SourceCounter for PgSourceCounter {
    async fn count(&self, schema: &str, table: &str) -> Result<i64, VerifierError> {
        let sql = format!("SELECT count(*) FROM {}.{}", quote_pg_ident(schema), quote_pg_ident(table));
        let row = tokio::time::timeout(self.query_timeout, self.client.query_one(&sql, &[]))
            .await
            .map_err(|_| VerifierError::Source(format!("count query for {schema}.{table} timed out")))?
            .map_err(|e| VerifierError::Source(e.to_string()))?;
        Ok(row.get::<_, i64>(0))
    }
}

/// Row-count lookups against the target ClickHouse database. [`TargetCounter::count`] is
/// called by [`ConsistencyVerifier`](crate::verifier::ConsistencyVerifier) with the bare
/// table name first, and `postgres.table` on fallback; both are passed straight through to a
/// `FROM` clause here.
pub struct ChTargetCounter {
    client: clickhouse::Client,
}

impl ChTargetCounter {
    pub fn new(client: clickhouse::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetCounter for ChTargetCounter {
    async fn count(&self, table: &str) -> Result<i64, VerifierError> {
        let quoted = match table.split_once('.') {
            Some((schema, bare)) => format!("{}.{}", quote_ch_ident(schema), quote_ch_ident(bare)),
            None => quote_ch_ident(table),
        };
        let sql = format!("SELECT count() FROM {quoted}");
        self.client
            .query(&sql)
            .fetch_one::<u64>()
            .await
            .map(|n| n as i64)
            .map_err(|e| VerifierError::Target(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Query(String),
}

/// Lists tables in a schema, for the periodic full-reconciliation sweep (component K).
#[async_trait]
pub trait TableCatalog: Send + Sync {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, CatalogError>;
}

/// Queries Postgres's `information_schema` for base tables in a schema.
pub struct PgTableCatalog {
    client: tokio_postgres::Client,
}

impl PgTableCatalog {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TableCatalog for PgTableCatalog {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
                &[&schema],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;
        Ok(rows.into_iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_ident_doubles_embedded_quotes() {
        assert_eq!(quote_pg_ident("orders"), "\"orders\"");
        assert_eq!(quote_pg_ident("weird\"table"), "\"weird\"\"table\"");
    }

    #[test]
    fn ch_ident_doubles_embedded_backticks() {
        assert_eq!(quote_ch_ident("orders"), "`orders`");
        assert_eq!(quote_ch_ident("weird`table"), "`weird``table`");
    }
}
