//! Convenience re-exports for the common composition: configure, build a reconciler,
//! and drive it.
//!
//! ```no_run
//! use echo_auto_mirror::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     run(config).await
//! }
//! ```

pub use crate::config::Config;
pub use crate::dedup::{DedupGuard, DedupRegistry};
pub use crate::event::{Channel, Event, MirrorOp, MirrorRequest};
pub use crate::executor::{MirrorExecutor, Outcome, PgReplicatorClient, ReplicatorClient};
pub use crate::kv::{InMemoryKvStore, KvStore, RedisKvStore};
pub use crate::leader::{LeaderElection, LeaderStatus};
pub use crate::listener::{EventSource, NotificationListener};
pub use crate::reconciler::{Reconciler, ReconcilerHandle};
pub use crate::stats::{AggregateStats, ConsistencyReport, StatsSnapshot};
pub use crate::verifier::{ConsistencyVerifier, SourceCounter, TargetCounter};
pub use crate::verify_service::{VerifyService, VerifyTrigger};

pub use crate::{Backoff, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, Jitter, RetryPolicy};

pub use crate::run;
