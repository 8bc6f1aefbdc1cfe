//! Reconciler: the top-level state machine driving notifications from the listener
//! through dedup, leadership gating, and the mirror executor.
//!
//! `ReconcilerCore` holds the pure event-handling logic (schema filter, exclusion
//! filter, dedup, dispatch, post-create verify, stats) against the trait seams, so it
//! can be driven by a fake [`EventSource`] in tests without a live Postgres/Redis/
//! ClickHouse stack. [`Reconciler`] wraps a core with the production wiring and the
//! follower/bootstrapping/active/reconnecting/terminating state machine.

use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitState};
use crate::config::Config;
use crate::counters::{ChTargetCounter, PgSourceCounter, PgTableCatalog};
use crate::dedup::DedupRegistry;
use crate::event::{Event, MirrorOp, MirrorRequest};
use crate::executor::{MirrorExecutor, Outcome, PgReplicatorClient, ReplicatorClient};
use crate::kv::{KvStore, RedisKvStore};
use crate::leader::{LeaderElection, LeaderStatus};
use crate::listener::{EventSource, ListenerError, NotificationListener};
use crate::stats::AggregateStats;
use crate::verifier::ConsistencyVerifier;
use crate::verify_service::{VerifyService, VerifyTrigger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tracks where a worker sits in the lifecycle, mirrored onto `/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Follower,
    Bootstrapping,
    Active,
    Reconnecting,
    Terminating,
}

/// The fakeable event-handling heart of the reconciler: given one [`Event`], decide
/// whether to skip it, and if not, dispatch it and record the outcome.
pub struct ReconcilerCore<C: ReplicatorClient + 'static, S: KvStore + 'static> {
    sync_schemas: Vec<String>,
    excluded_tables: Vec<String>,
    dedup: Arc<DedupRegistry<S>>,
    executor: Arc<MirrorExecutor<C>>,
    stats: Arc<AggregateStats>,
    on_create: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
}

impl<C: ReplicatorClient + 'static, S: KvStore + 'static> ReconcilerCore<C, S> {
    pub fn new(
        sync_schemas: Vec<String>,
        excluded_tables: Vec<String>,
        dedup: Arc<DedupRegistry<S>>,
        executor: Arc<MirrorExecutor<C>>,
        stats: Arc<AggregateStats>,
    ) -> Self {
        Self { sync_schemas, excluded_tables, dedup, executor, stats, on_create: None }
    }

    /// Installs a hook invoked (schema, table) after a successful `Create`, used to
    /// trigger the post-create consistency check without this module knowing the
    /// concrete verifier type.
    pub fn with_on_create(mut self, hook: Arc<dyn Fn(String, String) + Send + Sync>) -> Self {
        self.on_create = Some(hook);
        self
    }

    /// Exposes the executor for the periodic full-reconciliation sweep, which bypasses
    /// dedup and calls `Create` directly for every table in scope.
    pub fn executor(&self) -> Arc<MirrorExecutor<C>> {
        self.executor.clone()
    }

    fn in_sync_schema(&self, schema: &str) -> bool {
        self.sync_schemas.iter().any(|s| s == schema)
    }

    fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.iter().any(|t| t == table)
    }

    /// Processes one decoded [`Event`] end to end. Always marks the dedup key done
    /// when finished (via [`DedupRegistry::guard`]), regardless of which branch returns.
    pub async fn handle(&self, event: Event) {
        if !self.in_sync_schema(&event.schema) {
            tracing::debug!(schema = %event.schema, table = %event.table, "schema not in sync list, ignoring");
            return;
        }

        if event.channel == crate::event::Channel::Create && self.is_excluded(&event.table) {
            tracing::debug!(table = %event.table, "table excluded, ignoring create");
            return;
        }

        let key = event.dedup_key();
        if self.dedup.is_present(&key).await {
            self.stats.record_notification_deduplicated();
            tracing::debug!(key, "duplicate notification, skipping");
            return;
        }

        let _guard = self.dedup.guard(key).await;
        self.stats.record_notification_processed();

        let request = MirrorRequest::from(&event);
        match self.executor.apply(&request).await {
            Ok(outcome) => {
                if request.op == MirrorOp::Create {
                    self.stats.record_mirror_created();
                }
                tracing::info!(
                    schema = %request.schema, table = %request.table, op = ?request.op,
                    outcome = ?outcome, "mirror lifecycle command applied"
                );
                if request.op == MirrorOp::Create && outcome == Outcome::Applied {
                    if let Some(hook) = &self.on_create {
                        hook(request.schema.clone(), request.table.clone());
                    }
                }
            }
            Err(e) => {
                self.stats.record_mirror_failed(e.to_string());
                tracing::error!(
                    schema = %request.schema, table = %request.table, op = ?request.op,
                    error = %e, "mirror lifecycle command failed"
                );
            }
        }
    }
}

/// Concrete production types this binary wires together.
pub type ProdVerifier = ConsistencyVerifier<PgSourceCounter, ChTargetCounter>;
pub type ProdVerifyService = VerifyService<PgSourceCounter, ChTargetCounter, PgTableCatalog>;

/// Owns the full production stack and the lifecycle state machine.
pub struct Reconciler {
    config: Arc<Config>,
    core: Arc<ReconcilerCore<PgReplicatorClient, RedisKvStore>>,
    listener: tokio::sync::Mutex<NotificationListener>,
    leader: Arc<LeaderElection<RedisKvStore>>,
    verify_service: Arc<ProdVerifyService>,
    full_reconcile_catalog: Arc<PgTableCatalog>,
    stats: Arc<AggregateStats>,
    replicator_breaker: CircuitBreakerPolicy,
    postgres_breaker: CircuitBreakerPolicy,
    state: std::sync::Mutex<WorkerState>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

/// Shared, cheaply-cloneable view of reconciler state for the health/metrics surface.
/// Decoupled from `Reconciler` itself since `Reconciler::run` consumes `self`.
#[derive(Clone)]
pub struct ReconcilerHandle {
    leader: Arc<dyn LeaderStatus>,
    stats: Arc<AggregateStats>,
    verify_service: Arc<dyn crate::verify_service::VerifyTrigger>,
    replicator_breaker: CircuitBreakerPolicy,
    postgres_breaker: CircuitBreakerPolicy,
    connected: Arc<AtomicBool>,
}

impl ReconcilerHandle {
    #[cfg(test)]
    pub(crate) fn for_test(
        leader: Arc<dyn LeaderStatus>,
        stats: Arc<AggregateStats>,
        verify_service: Arc<dyn crate::verify_service::VerifyTrigger>,
        breaker: CircuitBreakerPolicy,
        connected: bool,
    ) -> Self {
        Self {
            leader,
            stats,
            verify_service,
            replicator_breaker: breaker.clone(),
            postgres_breaker: breaker,
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot(
            self.is_leader(),
            self.is_connected(),
            self.replicator_breaker.state(),
            self.postgres_breaker.state(),
        )
    }

    pub fn verify_trigger(&self) -> Arc<dyn crate::verify_service::VerifyTrigger> {
        self.verify_service.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerInitError {
    #[error("failed to connect to postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("failed to connect to redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to connect to clickhouse: {0}")]
    ClickHouse(String),
}

impl Reconciler {
    pub async fn new(config: Arc<Config>) -> Result<Self, ReconcilerInitError> {
        let redis_store = Arc::new(RedisKvStore::connect(&config.redis.url()).await?);

        let dedup = Arc::new(DedupRegistry::new(redis_store.clone()));
        let leader = Arc::new(LeaderElection::new(
            redis_store,
            config.leader.worker_id.clone(),
            config.leader.ttl,
        ));

        let (replicator_client, replicator_connection) = tokio_postgres::Config::new()
            .host(&config.peerdb.host)
            .port(config.peerdb.port)
            .user(&config.peerdb.user)
            .password(&config.peerdb.password)
            .connect(tokio_postgres::NoTls)
            .await?;
        tokio::spawn(async move {
            if let Err(e) = replicator_connection.await {
                tracing::error!(error = %e, "replicator connection driver exited");
            }
        });

        let replicator_breaker = CircuitBreakerPolicy::new(
            config.replicator_breaker.failure_threshold,
            config.replicator_breaker.timeout,
        )
        .with_success_threshold(config.replicator_breaker.success_threshold);

        let postgres_breaker = CircuitBreakerPolicy::new(
            config.postgres_breaker.failure_threshold,
            config.postgres_breaker.timeout,
        )
        .with_success_threshold(config.postgres_breaker.success_threshold);

        let executor = Arc::new(MirrorExecutor::new(
            Arc::new(PgReplicatorClient::new(replicator_client, config.replicator_breaker.timeout)),
            replicator_breaker.clone(),
            config.retry.max_retries,
            config.retry.retry_delay,
            config.retry.retry_backoff,
            config.source_peer_name.clone(),
            config.target_peer_name.clone(),
        ));

        let stats = Arc::new(AggregateStats::new(config.leader.worker_id.clone()));

        let verify_service = Arc::new(
            Self::build_verify_service(&config, postgres_breaker.clone(), stats.clone()).await?,
        );

        let core = Arc::new(
            ReconcilerCore::new(
                config.sync_schemas.clone(),
                config.excluded_tables.clone(),
                dedup,
                executor,
                stats.clone(),
            )
            .with_on_create({
                let verify_service = verify_service.clone();
                Arc::new(move |schema: String, table: String| {
                    let verify_service = verify_service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = verify_service.verify_one(&schema, &table).await {
                            tracing::warn!(schema, table, error = %e, "post-create consistency check failed");
                        }
                    });
                })
            }),
        );

        let listener = NotificationListener::new(
            config.postgres.clone(),
            config.postgres_breaker.timeout,
            config.reconnect.delay,
            config.reconnect.max_attempts,
        );

        let (reconcile_catalog_client, reconcile_catalog_connection) = tokio_postgres::Config::new()
            .host(&config.postgres.host)
            .port(config.postgres.port)
            .user(&config.postgres.user)
            .password(&config.postgres.password)
            .dbname(&config.postgres.dbname)
            .connect(tokio_postgres::NoTls)
            .await?;
        tokio::spawn(async move {
            if let Err(e) = reconcile_catalog_connection.await {
                tracing::error!(error = %e, "full-reconciliation catalog connection driver exited");
            }
        });
        let full_reconcile_catalog = Arc::new(PgTableCatalog::new(reconcile_catalog_client));

        Ok(Self {
            config,
            core,
            listener: tokio::sync::Mutex::new(listener),
            leader,
            verify_service,
            full_reconcile_catalog,
            stats,
            replicator_breaker,
            postgres_breaker,
            state: std::sync::Mutex::new(WorkerState::Follower),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    async fn build_verify_service(
        config: &Config,
        breaker: CircuitBreakerPolicy,
        stats: Arc<AggregateStats>,
    ) -> Result<ProdVerifyService, ReconcilerInitError> {
        let (source_client, source_connection) = tokio_postgres::Config::new()
            .host(&config.postgres.host)
            .port(config.postgres.port)
            .user(&config.postgres.user)
            .password(&config.postgres.password)
            .dbname(&config.postgres.dbname)
            .connect(tokio_postgres::NoTls)
            .await?;
        tokio::spawn(async move {
            if let Err(e) = source_connection.await {
                tracing::error!(error = %e, "source connection driver exited");
            }
        });

        let (catalog_client, catalog_connection) = tokio_postgres::Config::new()
            .host(&config.postgres.host)
            .port(config.postgres.port)
            .user(&config.postgres.user)
            .password(&config.postgres.password)
            .dbname(&config.postgres.dbname)
            .connect(tokio_postgres::NoTls)
            .await?;
        tokio::spawn(async move {
            if let Err(e) = catalog_connection.await {
                tracing::error!(error = %e, "catalog connection driver exited");
            }
        });

        let ch_url = format!(
            "http://{host}:{port}",
            host = config.clickhouse.host,
            port = config.clickhouse.port
        );
        let ch_client = clickhouse::Client::default()
            .with_url(ch_url)
            .with_user(&config.clickhouse.user)
            .with_password(&config.clickhouse.password)
            .with_database(&config.clickhouse.dbname);

        let verifier = ConsistencyVerifier::new(
            PgSourceCounter::new(source_client, config.postgres_breaker.timeout),
            ChTargetCounter::new(ch_client),
            breaker,
        );

        Ok(VerifyService::new(
            verifier,
            PgTableCatalog::new(catalog_client),
            config.sync_schemas.clone(),
            config.excluded_tables.clone(),
            stats,
        ))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<AggregateStats> {
        self.stats.clone()
    }

    pub fn verify_service(&self) -> Arc<ProdVerifyService> {
        self.verify_service.clone()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("reconciler state mutex poisoned") = state;
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("reconciler state mutex poisoned")
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot(
            self.is_leader(),
            self.is_connected(),
            self.replicator_breaker.state(),
            self.postgres_breaker.state(),
        )
    }

    /// A cheaply-cloneable handle carrying everything the health surface needs,
    /// independent of the `Reconciler` itself (whose `run` takes it by value).
    pub fn handle(&self) -> ReconcilerHandle {
        ReconcilerHandle {
            leader: self.leader.clone(),
            stats: self.stats.clone(),
            verify_service: self.verify_service.clone(),
            replicator_breaker: self.replicator_breaker.clone(),
            postgres_breaker: self.postgres_breaker.clone(),
            connected: self.connected.clone(),
        }
    }

    /// Drives the worker lifecycle until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let election_interval = self.config.leader.election_interval;
        let consistency_interval = self.config.consistency_check_interval;
        let full_reconcile_interval = self.config.full_reconcile_interval;

        if !consistency_interval.is_zero() {
            let verify_service = self.verify_service.clone();
            let shutdown = self.shutdown.clone();
            let leader = self.leader.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(consistency_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if leader.is_leader() {
                                verify_service.run_sweep().await;
                            }
                        }
                    }
                }
            });
        }

        if !full_reconcile_interval.is_zero() {
            let config = self.config.clone();
            let executor = self.core.executor();
            let catalog = self.full_reconcile_catalog.clone();
            let leader = self.leader.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(crate::full_reconcile::run_periodic(
                config, executor, catalog, leader, shutdown,
            ));
        }

        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(WorkerState::Terminating);
                self.leader.release().await;
                return Ok(());
            }

            self.set_state(WorkerState::Follower);
            tokio::select! {
                _ = self.shutdown.cancelled() => continue,
                acquired = self.leader.try_acquire() => {
                    match acquired {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => continue,
                                _ = tokio::time::sleep(election_interval) => continue,
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "leader election store error");
                            tokio::select! {
                                _ = self.shutdown.cancelled() => continue,
                                _ = tokio::time::sleep(election_interval) => continue,
                            }
                        }
                    }
                }
            }

            self.set_state(WorkerState::Bootstrapping);
            let mut listener = self.listener.lock().await;
            if let Err(e) = listener.reconnect().await {
                tracing::error!(error = %e, "failed to establish notification session, reconnect exhausted");
                self.connected.store(false, Ordering::Relaxed);
                drop(listener);
                self.leader.release().await;
                return Err(anyhow::anyhow!(
                    "notification session reconnect exhausted during bootstrap: {e}"
                ));
            }
            self.connected.store(true, Ordering::Relaxed);
            self.set_state(WorkerState::Active);

            let mut reconnect_exhausted = false;

            loop {
                if !self.leader.is_leader() {
                    tracing::warn!("lost leadership mid-loop, returning to follower state");
                    break;
                }

                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        drop(listener);
                        self.set_state(WorkerState::Terminating);
                        self.leader.release().await;
                        return Ok(());
                    }
                    event = listener.next_event() => {
                        match event {
                            Ok(event) => self.core.handle(event).await,
                            Err(ListenerError::Disconnected) => {
                                tracing::warn!("notification session disconnected, reconnecting");
                                self.set_state(WorkerState::Reconnecting);
                                self.connected.store(false, Ordering::Relaxed);
                                if let Err(e) = listener.reconnect().await {
                                    tracing::error!(error = %e, "reconnect exhausted, terminating");
                                    reconnect_exhausted = true;
                                    break;
                                }
                                self.connected.store(true, Ordering::Relaxed);
                                self.set_state(WorkerState::Active);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "notification listener error");
                                break;
                            }
                        }
                    }
                }
            }
            drop(listener);
            self.connected.store(false, Ordering::Relaxed);
            self.leader.release().await;

            if reconnect_exhausted {
                return Err(anyhow::anyhow!("postgres notification session reconnect exhausted"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Channel;
    use crate::kv::InMemoryKvStore;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeReplicator {
        responses: StdMutex<Vec<Result<(), crate::executor::ReplicatorError>>>,
    }

    #[async_trait::async_trait]
    impl ReplicatorClient for FakeReplicator {
        async fn execute(&self, _sql: &str) -> Result<(), crate::executor::ReplicatorError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(())
            } else {
                responses.remove(0)
            }
        }
    }

    fn core_with(
        responses: Vec<Result<(), crate::executor::ReplicatorError>>,
        excluded: Vec<String>,
    ) -> (Arc<ReconcilerCore<FakeReplicator, InMemoryKvStore>>, Arc<AggregateStats>) {
        let client = Arc::new(FakeReplicator { responses: StdMutex::new(responses) });
        let breaker = CircuitBreakerPolicy::new(100, Duration::from_secs(60));
        let mut executor = MirrorExecutor::new(
            client,
            breaker,
            0,
            Duration::from_millis(1),
            2.0,
            "source".into(),
            "target".into(),
        );
        executor.retry = crate::retry::RetryPolicy::builder()
            .max_attempts(1)
            .expect("valid")
            .backoff(crate::Backoff::constant(Duration::from_millis(1)))
            .with_jitter(crate::Jitter::None)
            .with_sleeper(crate::sleeper::InstantSleeper)
            .build();

        let dedup = Arc::new(DedupRegistry::new(Arc::new(InMemoryKvStore::new())));
        let stats = Arc::new(AggregateStats::new("worker-1".to_string()));
        let core = Arc::new(ReconcilerCore::new(
            vec!["public".to_string()],
            excluded,
            dedup,
            Arc::new(executor),
            stats.clone(),
        ));
        (core, stats)
    }

    fn event(channel: Channel, schema: &str, table: &str) -> Event {
        Event { channel, schema: schema.to_string(), table: table.to_string(), origin_pid: 1 }
    }

    #[tokio::test]
    async fn create_in_sync_schema_is_applied_and_counted() {
        let (core, stats) = core_with(vec![], vec![]);
        core.handle(event(Channel::Create, "public", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.mirrors_created, 1);
        assert_eq!(snap.notifications_processed, 1);
    }

    #[tokio::test]
    async fn create_for_excluded_table_is_ignored() {
        let (core, stats) = core_with(vec![], vec!["orders".to_string()]);
        core.handle(event(Channel::Create, "public", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.mirrors_created, 0);
        assert_eq!(snap.notifications_processed, 0);
    }

    #[tokio::test]
    async fn event_outside_sync_schemas_is_ignored() {
        let (core, stats) = core_with(vec![], vec![]);
        core.handle(event(Channel::Create, "other_schema", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.notifications_processed, 0);
    }

    #[tokio::test]
    async fn duplicate_event_is_deduplicated() {
        let (core, stats) = core_with(vec![], vec![]);
        core.handle(event(Channel::Create, "public", "orders")).await;
        core.handle(event(Channel::Create, "public", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.mirrors_created, 1);
        assert_eq!(snap.notifications_deduplicated, 1);
    }

    #[tokio::test]
    async fn drop_is_never_filtered_by_exclusion_list() {
        let (core, stats) = core_with(vec![], vec!["orders".to_string()]);
        core.handle(event(Channel::Drop, "public", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.notifications_processed, 1);
        assert_eq!(snap.mirrors_created, 0);
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_and_does_not_panic() {
        let (core, stats) = core_with(
            vec![
                Err(crate::executor::ReplicatorError::Query("connection reset".into())),
            ],
            vec![],
        );
        core.handle(event(Channel::Create, "public", "orders")).await;
        let snap = stats.snapshot(true, true, CircuitState::Closed, CircuitState::Closed);
        assert_eq!(snap.mirrors_failed, 1);
        assert!(snap.last_error.is_some());
    }
}
