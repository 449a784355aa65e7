//! # Store — optional resumability tier
//!
//! ## Responsibility
//! Abstract the key/value store used to persist generation task lists,
//! in-flight agents and selection history so a restarted engine can resume a
//! generation. The population manager always holds an `Arc<dyn Store>`;
//! when no external store is configured it holds a [`NoopStore`].
//!
//! ## Guarantees
//! - Atomic batches: `pipeline_write` applies all entries or none
//! - Expiring: entries written with a TTL vanish after it elapses
//! - Opaque values: JSON strings, never interpreted by the store
//!
//! ## NOT Responsible For
//! - Durability of evaluated agents (see: `archive`)
//! - Serialization of domain types (callers encode to JSON)

#[cfg(feature = "distributed")]
pub mod redis_store;

#[cfg(feature = "distributed")]
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::PersistenceSection;

/// Default expiry for persisted generation data (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Errors produced by [`Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the backing store.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A command against the store failed.
    #[error("store operation failed: {0}")]
    Operation(String),

    /// A value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One key/value pair in a batched write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    /// Full key, including prefix.
    pub key: String,
    /// JSON-encoded value.
    pub value: String,
    /// Expiry; `None` keeps the entry until overwritten.
    pub ttl: Option<Duration>,
}

impl StoreEntry {
    /// Entry with the given expiry.
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Key/value persistence used for resumability.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a value, or `None` if absent or expired.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the store cannot be queried.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a single value.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write every entry as one atomic batch.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the batch fails; nothing is written in that case.
    async fn pipeline_write(&self, entries: Vec<StoreEntry>) -> Result<(), StoreError>;
}

// ─── Key layout ───────────────────────────────────────────────────────────────

/// Key of a generation's serialized task list.
pub fn generation_tasks_key(prefix: &str, generation: u32) -> String {
    format!("{prefix}:generation:{generation}:tasks")
}

/// Key of a generation's in-flight agents.
pub fn generation_agents_key(prefix: &str, generation: u32) -> String {
    format!("{prefix}:generation:{generation}:agents")
}

/// Key of a generation's parent-selection history.
pub fn selection_key(prefix: &str, generation: u32) -> String {
    format!("{prefix}:selection:{generation}")
}

/// Store selected by the `[persistence]` section.
///
/// No `redis_url` gives a [`NoopStore`].
///
/// # Errors
/// - [`StoreError::Connection`] if the URL cannot be opened, or a URL is set
///   but the crate was built without the `distributed` feature.
pub fn from_config(persistence: &PersistenceSection) -> Result<Arc<dyn Store>, StoreError> {
    match persistence.redis_url.as_deref() {
        None => Ok(Arc::new(NoopStore)),
        #[cfg(feature = "distributed")]
        Some(url) => Ok(Arc::new(RedisStore::new(url)?)),
        #[cfg(not(feature = "distributed"))]
        Some(url) => Err(StoreError::Connection(format!(
            "redis_url {url} configured but the `distributed` feature is disabled"
        ))),
    }
}

// ─── Implementations ──────────────────────────────────────────────────────────

/// Store that accepts every write and never returns data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl Store for NoopStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn pipeline_write(&self, _entries: Vec<StoreEntry>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process store with TTL support, useful for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, exp)| exp.map_or(true, |e| e > now))
            .count()
    }

    /// `true` if no live key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        let expired = matches!(entries.get(key), Some((_, Some(exp))) if *exp <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expiry = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn pipeline_write(&self, batch: Vec<StoreEntry>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for entry in batch {
            entries.insert(entry.key, (entry.value, entry.ttl.map(|t| now + t)));
        }
        Ok(())
    }
}
