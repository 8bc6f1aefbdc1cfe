//! Notification listener: owns the Postgres `LISTEN` session, decodes payloads on the
//! two mirror-lifecycle channels, and reconnects on connection loss.
//!
//! Grounded on the usual tokio-postgres idiom for `LISTEN`/`NOTIFY`: `connect` returns a
//! `(Client, Connection)` pair, and the `Connection` future must be driven independently
//! (here, on a spawned task) or no I/O happens at all. That driver task forwards
//! `AsyncMessage::Notification` onto an mpsc channel this listener reads from; the channel
//! closing is how the driver communicates "the connection died" back to us.

use crate::config::PostgresConfig;
use crate::event::{Channel, Event, NotifyPayload};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_postgres::AsyncMessage;

const CREATE_CHANNEL: &str = "peerdb_create_mirror";
const DROP_CHANNEL: &str = "peerdb_drop_mirror";

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to connect to postgres: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to subscribe to notification channel: {0}")]
    Listen(String),
    #[error("notification session disconnected")]
    Disconnected,
    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(usize),
}

/// Seam between the reconciler loop and the Postgres session, so the loop's state
/// machine can be tested against a fake without a live database.
#[async_trait]
pub trait EventSource: Send {
    /// Waits for, decodes, and returns the next well-formed event. Malformed payloads on
    /// either channel are logged and skipped internally; this only returns on a genuine
    /// event or a fatal session error.
    async fn next_event(&mut self) -> Result<Event, ListenerError>;

    /// Drives the reconnect policy: up to some bounded number of attempts, spaced by some
    /// bounded delay. Resubscribes both channels on success.
    async fn reconnect(&mut self) -> Result<(), ListenerError>;

    fn is_connected(&self) -> bool;
}

struct Session {
    #[allow(dead_code)] // kept alive so the driver task's client handle isn't dropped
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
    notifications: mpsc::UnboundedReceiver<tokio_postgres::Notification>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Production [`EventSource`]: a dedicated (non-pooled) Postgres connection in autocommit
/// isolation, subscribed to both mirror-lifecycle channels.
pub struct NotificationListener {
    postgres: PostgresConfig,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: usize,
    session: Option<Session>,
}

impl NotificationListener {
    pub fn new(
        postgres: PostgresConfig,
        connect_timeout: Duration,
        reconnect_delay: Duration,
        max_reconnect_attempts: usize,
    ) -> Self {
        Self { postgres, connect_timeout, reconnect_delay, max_reconnect_attempts, session: None }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.postgres.host)
            .port(self.postgres.port)
            .user(&self.postgres.user)
            .password(&self.postgres.password)
            .dbname(&self.postgres.dbname);
        config
    }

    async fn connect_session(&self) -> Result<Session, ListenerError> {
        let (client, mut connection) = tokio::time::timeout(
            self.connect_timeout,
            self.pg_config().connect(tokio_postgres::NoTls),
        )
        .await
        .map_err(|_| ListenerError::ConnectTimeout(self.connect_timeout))?
        .map_err(|e| ListenerError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            while let Some(message) = futures::future::poll_fn(|cx| connection.poll_message(cx)).await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!(message = %notice.message(), "postgres notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "postgres notification connection error");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {CREATE_CHANNEL}; LISTEN {DROP_CHANNEL};"))
            .await
            .map_err(|e| ListenerError::Listen(e.to_string()))?;

        Ok(Session { client, driver, notifications: rx })
    }

    fn decode(notification: &tokio_postgres::Notification) -> Option<Event> {
        let channel = Channel::from_notify_channel(notification.channel())?;
        match serde_json::from_str::<NotifyPayload>(notification.payload()) {
            Ok(payload) => Some(Event {
                channel,
                schema: payload.schema,
                table: payload.table,
                origin_pid: notification.process_id(),
            }),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    payload = notification.payload(),
                    channel = notification.channel(),
                    "dropping malformed notification payload"
                );
                None
            }
        }
    }
}

#[async_trait]
impl EventSource for NotificationListener {
    async fn next_event(&mut self) -> Result<Event, ListenerError> {
        loop {
            let session = self.session.as_mut().ok_or(ListenerError::Disconnected)?;
            match session.notifications.recv().await {
                Some(notification) => {
                    if let Some(event) = Self::decode(&notification) {
                        return Ok(event);
                    }
                    // malformed payload: loop and wait for the next notification
                }
                None => {
                    self.session = None;
                    return Err(ListenerError::Disconnected);
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ListenerError> {
        self.session = None;
        for attempt in 1..=self.max_reconnect_attempts {
            match self.connect_session().await {
                Ok(session) => {
                    self.session = Some(session);
                    tracing::info!(attempt, "reconnected notification listener");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    if attempt < self.max_reconnect_attempts {
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }
        Err(ListenerError::ReconnectExhausted(self.max_reconnect_attempts))
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
