//! Environment-variable-driven configuration.
//!
//! Every knob is read once, at startup, into an immutable [`Config`]; nothing in this
//! crate re-reads the environment afterward. [`Config::from_env`] collects every
//! parsing violation before returning, so a misconfigured deployment surfaces all of
//! its problems in one pass rather than one environment variable at a time.

use std::env::VarError;
use std::time::Duration;

/// A single environment variable that failed to parse, paired with why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{variable}: {reason}")]
pub struct Violation {
    pub variable: &'static str,
    pub reason: String,
}

/// Raised by [`Config::from_env`] when one or more variables are missing or invalid.
#[derive(Debug, Clone)]
pub struct ConfigError(pub Vec<Violation>);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration ({} violation(s)): ", self.0.len())?;
        let joined = self
            .0
            .iter()
            .map(|v| format!("{}: {}", v.variable, v.reason))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", joined)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

#[derive(Debug, Clone)]
pub struct PeerDbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Build a `redis://` connection URL from the discrete fields.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{host}:{port}/{db}",
                password = password,
                host = self.host,
                port = self.port,
                db = self.db
            ),
            None => format!("redis://{host}:{port}/{db}", host = self.host, port = self.port, db = self.db),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub delay: Duration,
    pub max_attempts: usize,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub ttl: Duration,
    pub election_interval: Duration,
    pub worker_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub peerdb: PeerDbConfig,
    pub clickhouse: ClickHouseConfig,
    pub redis: RedisConfig,
    pub source_peer_name: String,
    pub target_peer_name: String,
    pub sync_schemas: Vec<String>,
    pub excluded_tables: Vec<String>,
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
    pub leader: LeaderConfig,
    pub replicator_breaker: BreakerConfig,
    pub postgres_breaker: BreakerConfig,
    pub consistency_check_interval: Duration,
    pub full_reconcile_interval: Duration,
    pub health_port: u16,
    pub log_level: String,
}

/// Accumulates [`Violation`]s while pulling values out of the environment, so
/// `from_env` can report every problem instead of stopping at the first one.
struct Reader {
    violations: Vec<Violation>,
}

impl Reader {
    fn new() -> Self {
        Self { violations: Vec::new() }
    }

    fn fail(&mut self, variable: &'static str, reason: impl Into<String>) {
        self.violations.push(Violation { variable, reason: reason.into() });
    }

    fn string(&mut self, name: &'static str, default: &str) -> String {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) | Err(VarError::NotPresent) => default.to_string(),
            Err(VarError::NotUnicode(_)) => {
                self.fail(name, "value is not valid unicode");
                default.to_string()
            }
        }
    }

    fn required_string(&mut self, name: &'static str) -> String {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) | Err(VarError::NotPresent) => {
                self.fail(name, "required but not set");
                String::new()
            }
            Err(VarError::NotUnicode(_)) => {
                self.fail(name, "value is not valid unicode");
                String::new()
            }
        }
    }

    fn parsed<T: std::str::FromStr>(&mut self, name: &'static str, default: T) -> T
    where
        T::Err: std::fmt::Display,
    {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => match v.parse() {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.fail(name, format!("failed to parse {:?}: {}", v, e));
                    default
                }
            },
            Ok(_) | Err(VarError::NotPresent) => default,
            Err(VarError::NotUnicode(_)) => {
                self.fail(name, "value is not valid unicode");
                default
            }
        }
    }

    fn duration_secs(&mut self, name: &'static str, default_secs: u64) -> Duration {
        Duration::from_secs(self.parsed(name, default_secs))
    }

    /// Accepts either a comma-separated list or a JSON array of strings.
    fn string_list(&mut self, name: &'static str) -> Vec<String> {
        match std::env::var(name) {
            Ok(v) if v.trim().is_empty() => Vec::new(),
            Ok(v) => {
                let trimmed = v.trim();
                if trimmed.starts_with('[') {
                    match serde_json::from_str::<Vec<String>>(trimmed) {
                        Ok(list) => list,
                        Err(e) => {
                            self.fail(name, format!("invalid JSON array: {}", e));
                            Vec::new()
                        }
                    }
                } else {
                    trimmed
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                }
            }
            Err(VarError::NotPresent) => Vec::new(),
            Err(VarError::NotUnicode(_)) => {
                self.fail(name, "value is not valid unicode");
                Vec::new()
            }
        }
    }
}

impl Config {
    /// Load configuration from the process environment, collecting every violation
    /// before failing. Nothing is re-read after this call returns.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut r = Reader::new();

        let config = Config {
            postgres: PostgresConfig {
                host: r.string("POSTGRES_HOST", "localhost"),
                port: r.parsed("POSTGRES_PORT", 5432),
                user: r.required_string("POSTGRES_USER"),
                password: r.required_string("POSTGRES_PASSWORD"),
                dbname: r.required_string("POSTGRES_DB"),
            },
            peerdb: PeerDbConfig {
                host: r.required_string("PEERDB_HOST"),
                port: r.parsed("PEERDB_PORT", 9900),
                user: r.string("PEERDB_USER", "peerdb"),
                password: r.string("PEERDB_PASSWORD", ""),
            },
            clickhouse: ClickHouseConfig {
                host: r.required_string("CLICKHOUSE_HOST"),
                port: r.parsed("CLICKHOUSE_PORT", 8123),
                user: r.string("CLICKHOUSE_USER", "default"),
                password: r.string("CLICKHOUSE_PASSWORD", ""),
                dbname: r.string("CLICKHOUSE_DB", "default"),
            },
            redis: RedisConfig {
                host: r.string("REDIS_HOST", "localhost"),
                port: r.parsed("REDIS_PORT", 6379),
                password: {
                    let p = r.string("REDIS_PASSWORD", "");
                    if p.is_empty() { None } else { Some(p) }
                },
                db: r.parsed("REDIS_DB", 0),
            },
            source_peer_name: r.required_string("SOURCE_PEER_NAME"),
            target_peer_name: r.required_string("TARGET_PEER_NAME"),
            sync_schemas: {
                let list = r.string_list("SYNC_SCHEMA");
                if list.is_empty() { vec!["public".to_string()] } else { list }
            },
            excluded_tables: r.string_list("EXCLUDED_TABLES"),
            retry: RetryConfig {
                max_retries: r.parsed("MAX_RETRIES", 5),
                retry_delay: r.duration_secs("RETRY_DELAY", 5),
                retry_backoff: r.parsed("RETRY_BACKOFF", 2.0),
            },
            reconnect: ReconnectConfig {
                delay: r.duration_secs("RECONNECT_DELAY", 10),
                max_attempts: r.parsed("MAX_RECONNECT_ATTEMPTS", 10),
            },
            leader: LeaderConfig {
                ttl: r.duration_secs("LEADER_ELECTION_TTL", 30),
                election_interval: r.duration_secs("LEADER_ELECTION_INTERVAL", 10),
                worker_id: {
                    let configured = r.string("WORKER_ID", "");
                    if configured.is_empty() {
                        format!("worker-{}", uuid::Uuid::new_v4().simple())
                    } else {
                        configured
                    }
                },
            },
            replicator_breaker: BreakerConfig {
                failure_threshold: r.parsed("REPLICATOR_FAILURE_THRESHOLD", 5),
                success_threshold: r.parsed("REPLICATOR_SUCCESS_THRESHOLD", 2),
                timeout: r.duration_secs("REPLICATOR_TIMEOUT", 60),
            },
            postgres_breaker: BreakerConfig {
                failure_threshold: r.parsed("POSTGRES_FAILURE_THRESHOLD", 3),
                success_threshold: r.parsed("POSTGRES_SUCCESS_THRESHOLD", 2),
                timeout: r.duration_secs("POSTGRES_TIMEOUT", 30),
            },
            consistency_check_interval: r.duration_secs("CONSISTENCY_CHECK_INTERVAL", 900),
            full_reconcile_interval: r.duration_secs("FULL_RECONCILE_INTERVAL", 3600),
            health_port: r.parsed("HEALTH_PORT", 8080),
            log_level: r.string("LOG_LEVEL", "info"),
        };

        if r.violations.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError(r.violations))
        }
    }

    pub fn mirror_name(table: &str) -> String {
        format!("{table}_mirror")
    }
}
