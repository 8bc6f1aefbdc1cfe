#![forbid(unsafe_code)]

//! CDC control plane reconciling Postgres DDL notifications into PeerDB mirror
//! lifecycle commands, replicating qualifying tables from Postgres into ClickHouse.
//!
//! ## Layout
//!
//! - Resilience primitives (retry, circuit breaker, backoff, jitter) are generic and
//!   reusable in isolation — see [`prelude`] for a quick-start composition.
//! - Domain modules ([`leader`], [`dedup`], [`executor`], [`verifier`], [`verify_service`],
//!   [`listener`], [`reconciler`]) build the control plane itself on top of those
//!   primitives. Full-table-sweep reconciliation and the Postgres/ClickHouse driver
//!   glue behind [`verifier`]'s traits live in private modules reached only through
//!   [`reconciler::Reconciler`].
//! - [`config`] loads every environment-variable-driven knob once at startup.
//! - [`health`] exposes the read-only HTTP surface over [`stats`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use echo_auto_mirror::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     echo_auto_mirror::run(config).await
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod counters;
mod error;
mod full_reconcile;
mod jitter;
mod retry;
mod sleeper;

pub mod config;
pub mod dedup;
pub mod event;
pub mod executor;
pub mod health;
pub mod kv;
pub mod leader;
pub mod listener;
pub mod reconciler;
pub mod stats;
pub mod verifier;
pub mod verify_service;

pub mod prelude;

pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub use config::Config;
pub use reconciler::{Reconciler, ReconcilerHandle};

use std::sync::Arc;

/// Wire every component together and drive the reconciler to completion.
///
/// Exists as a library function (rather than being inlined in `main`) so that
/// `src/bin/echo-auto-mirror.rs` and integration tests share the same wiring.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let reconciler = Reconciler::new(config.clone()).await?;
    let shutdown = reconciler.shutdown_token();
    let handle = reconciler.handle();

    let health_server = tokio::spawn(health::serve(config.clone(), handle, shutdown.clone()));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let outcome = reconciler.run().await;
    health_server.abort();
    outcome
}
