//! Shared key/value store abstraction backing leader election and notification dedup.
//!
//! Modeled after the token-store abstraction used elsewhere in this crate's resilience
//! layer: an async trait over a distributed backend, with a Redis implementation and an
//! in-memory fake for tests.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key/value operations the control plane needs: atomic lease acquisition,
/// compare-and-delete release, renewal, plain get/set-with-ttl, and existence checks.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `SET key value NX EX ttl`. Returns `true` if this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Self::Error>;

    /// Plain read.
    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Delete `key` only if its current value equals `expected` (atomic compare-and-delete).
    /// Returns `true` if the key was deleted.
    async fn delete_if_match(&self, key: &str, expected: &str) -> Result<bool, Self::Error>;

    /// Refresh `key`'s TTL without changing its value. No-op if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Self::Error>;

    /// `SET key value EX ttl`, overwriting unconditionally.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Self::Error>;

    async fn exists(&self, key: &str) -> Result<bool, Self::Error>;
}

/// Redis-backed [`KvStore`]. Shares one [`ConnectionManager`] (cloneable, reconnects
/// transparently) across leader election and the dedup registry.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

/// Lua script implementing atomic compare-and-delete: only the owner of a lease
/// (matching the stored value) may remove it. Avoids the check-then-delete race a
/// plain GET followed by DEL would have under concurrent leadership transitions.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl RedisKvStore {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    type Error = redis::RedisError;

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    async fn delete_if_match(&self, key: &str, expected: &str) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        conn.exists(key).await
    }
}

/// In-memory fake for tests. Ignores TTLs (callers assert behavior within a single
/// test, well inside any real expiry window).
#[derive(Default, Clone, Debug)]
pub struct InMemoryKvStore {
    data: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    type Error = std::convert::Infallible;

    async fn set_nx_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, Self::Error> {
        let mut guard = self.data.lock().expect("InMemoryKvStore mutex poisoned");
        if guard.contains_key(key) {
            Ok(false)
        } else {
            guard.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.data.lock().expect("InMemoryKvStore mutex poisoned").get(key).cloned())
    }

    async fn delete_if_match(&self, key: &str, expected: &str) -> Result<bool, Self::Error> {
        let mut guard = self.data.lock().expect("InMemoryKvStore mutex poisoned");
        if guard.get(key).map(|v| v.as_str()) == Some(expected) {
            guard.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), Self::Error> {
        self.data.lock().expect("InMemoryKvStore mutex poisoned").insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.data.lock().expect("InMemoryKvStore mutex poisoned").contains_key(key))
    }
}
