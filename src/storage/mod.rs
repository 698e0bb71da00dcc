//! Storage engines.
//!
//! Every backend implements the [`Storage`] contract so the dispatcher can be
//! handed any of them at startup:
//! - `memory`: concurrent in-process map with lazy expiry
//! - `postgres`: PostgreSQL / CockroachDB table
//! - `sqlite`: SQLite table (file or in-memory)
//! - `passthrough`: pass-through to an external Redis-compatible server
//!
//! A record whose expiry is due is treated as absent by every operation,
//! whether or not the periodic sweep has physically removed it yet.

pub mod memory;
pub mod passthrough;
pub mod pattern;
pub mod postgres;
pub mod sqlite;

use crate::config::{StorageConfig, StorageMode};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use passthrough::RedisStorage;
pub use sqlite::SqliteStorage;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Backend failures. The dispatcher never shows these to clients.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("postgres pool setup: {0}")]
    PoolSetup(#[from] deadpool_postgres::CreatePoolError),

    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Key does not exist or is already logically expired
    Absent,
    /// Key exists and never expires
    Persistent,
    /// Key exists and expires after the given duration
    Expires(Duration),
}

/// Result of a SET that may carry extra options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// Value written
    Stored,
    /// A condition (NX/XX) prevented the write
    NotStored,
    /// SET ... GET: the previous value, if any
    Value(Option<Bytes>),
}

/// Capability contract shared by all backends.
///
/// TTL conventions: `set` with `Duration::ZERO` stores the key without an
/// expiry, while `set_expiry` with `Duration::ZERO` puts the deadline at
/// "now", which expires the key immediately.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Physically remove every record whose expiry is due.
    /// Returns how many records were removed, where the backend knows.
    async fn clear_expired(&self) -> Result<u64>;

    /// Insert or overwrite `key`. A zero `ttl` clears any previous expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Value of a live key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Delete a key. Returns whether it was live before the call.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Change the expiry of a live key. Returns false if absent or expired.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining lifetime of a key
    async fn expiry(&self, key: &str) -> Result<Expiry>;

    /// All live keys matching a glob pattern (see [`pattern`])
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// One page of live keys matching `pattern`, starting at `cursor`.
    /// Returns the cursor for the next page, 0 once enumeration is complete.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// SET with trailing protocol options.
    ///
    /// Direct backends only support the plain two-argument form, so the
    /// options are ignored here; the pass-through backend forwards them.
    async fn set_forward(&self, key: &str, value: Bytes, _options: &[Bytes]) -> Result<SetOutcome> {
        self.set(key, value, Duration::ZERO).await?;
        Ok(SetOutcome::Stored)
    }

    /// Values for several keys, aligned with the input
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Delete several keys, returning how many of them were live
    async fn del_many(&self, keys: &[String]) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            if self.del(key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Redis type name of a key
    async fn key_type(&self, key: &str) -> Result<String> {
        Ok(match self.get(key).await? {
            Some(_) => "string".to_string(),
            None => "none".to_string(),
        })
    }
}

/// Open the backend selected by the configuration.
///
/// SQL backends create their table if needed, so a reachable but empty
/// database works out of the box. Any failure here aborts startup.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match &config.mode {
        StorageMode::Memory => Arc::new(MemoryStorage::new()),
        StorageMode::Postgres(dsn) => Arc::new(
            PostgresStorage::connect(
                dsn,
                config.pool_size,
                Duration::from_secs(config.conn_max_lifetime),
            )
            .await?,
        ),
        StorageMode::Sqlite(path) => Arc::new(SqliteStorage::open(path).await?),
        StorageMode::Redis(url) => Arc::new(RedisStorage::connect(url).await?),
    };

    info!(backend = storage.name(), "Storage ready");
    Ok(storage)
}
