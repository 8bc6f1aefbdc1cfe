//! Periodic full reconciliation: on its own timer, lists every table in
//! `sync_schemas \ excluded_tables` and issues an idempotent `Create` for each,
//! closing the window a missed notification (e.g. during a leader failover) would
//! otherwise leave open indefinitely.
//!
//! Bypasses the dedup registry entirely — every sweep revisits the full set, and the
//! executor's own idempotent-conflict handling absorbs tables that are already mirrored.

use crate::config::Config;
use crate::counters::{PgTableCatalog, TableCatalog};
use crate::executor::{MirrorExecutor, Outcome};
use crate::event::{MirrorOp, MirrorRequest};
use crate::kv::RedisKvStore;
use crate::leader::LeaderElection;
use crate::executor::ReplicatorClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives the sweep on `config.full_reconcile_interval` until cancelled. Runs only
/// while this worker holds leadership; a follower simply waits out each tick.
pub async fn run_periodic<C: ReplicatorClient + 'static>(
    config: Arc<Config>,
    executor: Arc<MirrorExecutor<C>>,
    catalog: Arc<PgTableCatalog>,
    leader: Arc<LeaderElection<RedisKvStore>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.full_reconcile_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if leader.is_leader() {
                    sweep(&config, &executor, catalog.as_ref()).await;
                }
            }
        }
    }
}

async fn sweep<C: ReplicatorClient + 'static>(
    config: &Config,
    executor: &MirrorExecutor<C>,
    catalog: &dyn TableCatalog,
) {
    for schema in &config.sync_schemas {
        let tables = match catalog.list_tables(schema).await {
            Ok(tables) => tables,
            Err(e) => {
                tracing::warn!(schema, error = %e, "full reconciliation: failed to list tables");
                continue;
            }
        };

        for table in tables {
            if config.excluded_tables.contains(&table) {
                continue;
            }

            let request = MirrorRequest {
                schema: schema.clone(),
                table: table.clone(),
                op: MirrorOp::Create,
                mirror_name: Config::mirror_name(&table),
            };

            match executor.apply(&request).await {
                Ok(Outcome::Applied) => {
                    tracing::info!(schema, table, "full reconciliation: created missing mirror");
                }
                Ok(Outcome::AlreadyInDesiredState) => {}
                Err(e) => {
                    tracing::warn!(schema, table, error = %e, "full reconciliation: failed to create mirror");
                }
            }
        }
    }
}
