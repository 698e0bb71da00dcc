//! Backing sources for user secrets.

use crate::storage::{self, Storage, StorageError};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::sync::Arc;
use thiserror::Error;

/// Key prefix of user records kept in a storage engine. The leading colon
/// places them outside every tenant namespace, since usernames never
/// contain a colon.
pub const USER_KEY_PREFIX: &str = ":users:";

/// Outcome of a failed secret lookup
#[derive(Debug, Error)]
pub enum LookupError {
    /// No such user; never retried
    #[error("user not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("stored secret for '{0}' is not valid UTF-8")]
    Encoding(String),
}

/// Where the secret for a username comes from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn secret(&self, username: &str) -> Result<String, LookupError>;
}

/// Reads `password` from a `users(username, password)` table.
pub struct PostgresCredentialSource {
    pool: Pool,
}

impl PostgresCredentialSource {
    pub fn new(dsn: &str, pool_size: usize) -> Result<Self, StorageError> {
        Ok(Self {
            pool: storage::postgres::create_pool(dsn, pool_size)?,
        })
    }
}

#[async_trait]
impl CredentialSource for PostgresCredentialSource {
    async fn secret(&self, username: &str) -> Result<String, LookupError> {
        let client = self.pool.get().await.map_err(StorageError::from)?;
        let row = client
            .query_opt("SELECT password FROM users WHERE username = $1", &[&username])
            .await
            .map_err(StorageError::from)?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(LookupError::NotFound),
        }
    }
}

/// Reads secrets stored under `:users:<username>` in a storage engine.
pub struct StorageCredentialSource {
    storage: Arc<dyn Storage>,
}

impl StorageCredentialSource {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn key(username: &str) -> String {
        format!("{USER_KEY_PREFIX}{username}")
    }
}

#[async_trait]
impl CredentialSource for StorageCredentialSource {
    async fn secret(&self, username: &str) -> Result<String, LookupError> {
        let value = self
            .storage
            .get(&Self::key(username))
            .await?
            .ok_or(LookupError::NotFound)?;

        String::from_utf8(value.to_vec()).map_err(|_| LookupError::Encoding(username.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_storage_source_lookup() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(":users:bob", Bytes::from_static(b"hunter2"), Duration::ZERO)
            .await
            .unwrap();

        let source = StorageCredentialSource::new(storage.clone());
        assert_eq!(source.secret("bob").await.unwrap(), "hunter2");
        assert!(matches!(source.secret("eve").await, Err(LookupError::NotFound)));
    }

    #[tokio::test]
    async fn test_storage_source_rejects_binary_secret() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(&StorageCredentialSource::key("bin"), Bytes::from_static(&[0xff, 0xfe]), Duration::ZERO)
            .await
            .unwrap();

        let source = StorageCredentialSource::new(storage);
        assert!(matches!(source.secret("bin").await, Err(LookupError::Encoding(_))));
    }
}
