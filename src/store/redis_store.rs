//! # Redis-backed store
//!
//! ## Responsibility
//! Implement [`Store`] over Redis so generation state survives an engine
//! restart and can be inspected by other nodes.
//!
//! ## Guarantees
//! - Atomic batches: `pipeline_write` uses `MULTI`/`EXEC` via `redis::pipe().atomic()`
//! - TTL-bounded: entries with a TTL are written with `SET .. EX`
//! - Non-blocking: async multiplexed connections only
//!
//! ## NOT Responsible For
//! - Connection pooling beyond what the multiplexed connection provides

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Store, StoreEntry, StoreError};

/// [`Store`] backed by a Redis server.
///
/// # Example
///
/// ```no_run
/// use tokio_evolution_orchestrator::store::{RedisStore, Store};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisStore::new("redis://localhost:6379")?;
/// store.set("evo:probe", "{}", None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
}

impl RedisStore {
    /// Open a client for `redis_url`. No connection is made until first use.
    ///
    /// # Errors
    /// Returns [`StoreError::Connection`] if the URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(format!("failed to open Redis client: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to get connection: {e}")))
    }
}

fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("EX").arg(ttl.as_secs().max(1));
    }
    cmd
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(format!("GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        set_cmd(key, value, ttl)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(format!("SET failed: {e}")))
    }

    async fn pipeline_write(&self, entries: Vec<StoreEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in &entries {
            pipe.add_command(set_cmd(&entry.key, &entry.value, entry.ttl))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(format!("pipeline failed: {e}")))?;
        debug!(entries = entries.len(), "pipeline written");
        Ok(())
    }
}
