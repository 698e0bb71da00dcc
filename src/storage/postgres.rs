//! PostgreSQL / CockroachDB storage engine.
//!
//! One table holds every record. Each statement carries the liveness
//! predicate `(e IS NULL OR e > now)` itself, so a row that is due but not
//! yet swept is never read, updated or deleted as if it were live. No other
//! coordination with the sweep is needed.

use super::pattern::KeyPattern;
use super::{Expiry, Result, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    k TEXT PRIMARY KEY,
    v BYTEA NOT NULL,
    e TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS kv_e_idx ON kv (e);
"#;

/// Storage backed by a pooled PostgreSQL-compatible database.
pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    /// Build the connection pool, verify connectivity and create the schema.
    ///
    /// Pooled connections older than `max_lifetime` are retired in the
    /// background; a zero `max_lifetime` keeps them forever.
    pub async fn connect(dsn: &str, pool_size: usize, max_lifetime: Duration) -> Result<Self> {
        let pool = create_pool(dsn, pool_size)?;
        pool.get().await?.batch_execute(SCHEMA).await?;
        info!(pool_size, "PostgreSQL schema ready");

        if !max_lifetime.is_zero() {
            spawn_connection_reaper(pool.clone(), max_lifetime);
        }

        Ok(Self { pool })
    }
}

/// Create a deadpool pool for `dsn` without opening any connection yet
pub(crate) fn create_pool(dsn: &str, pool_size: usize) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.url = Some(dsn.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(pool_size.max(1)));
    Ok(cfg.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

/// Periodically drop idle pooled connections that outlived `max_lifetime`
fn spawn_connection_reaper(pool: Pool, max_lifetime: Duration) {
    let period = (max_lifetime / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let _ = pool.retain(|_, metrics| metrics.age() < max_lifetime);
        }
    });
}

/// Absolute deadline for `ttl`, or `None` for "never expires"
fn deadline(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}

/// Classify a stored expiry column read under the liveness filter
fn classify(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Expiry {
    match expires_at {
        None => Expiry::Persistent,
        Some(at) => match (at - now).to_std() {
            Ok(left) if !left.is_zero() => Expiry::Expires(left),
            _ => Expiry::Absent,
        },
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn clear_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let removed = self
            .pool
            .get()
            .await?
            .execute("DELETE FROM kv WHERE e <= $1", &[&now])
            .await?;
        Ok(removed)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            deadline(Utc::now(), ttl)
        };

        let value: &[u8] = &value;
        self.pool
            .get()
            .await?
            .execute(
                "INSERT INTO kv (k, v, e) VALUES ($1, $2, $3) \
                 ON CONFLICT (k) DO UPDATE SET v = excluded.v, e = excluded.e",
                &[&key, &value, &expires_at],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Utc::now();
        let row = self
            .pool
            .get()
            .await?
            .query_opt(
                "SELECT v FROM kv WHERE k = $1 AND (e IS NULL OR e > $2)",
                &[&key, &now],
            )
            .await?;
        Ok(row.map(|r| Bytes::from(r.get::<_, Vec<u8>>(0))))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        let affected = self
            .pool
            .get()
            .await?
            .execute(
                "DELETE FROM kv WHERE k = $1 AND (e IS NULL OR e > $2)",
                &[&key, &now],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = deadline(now, ttl);
        let affected = self
            .pool
            .get()
            .await?
            .execute(
                "UPDATE kv SET e = $2 WHERE k = $1 AND (e IS NULL OR e > $3)",
                &[&key, &expires_at, &now],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn expiry(&self, key: &str) -> Result<Expiry> {
        let now = Utc::now();
        let row = self
            .pool
            .get()
            .await?
            .query_opt(
                "SELECT e FROM kv WHERE k = $1 AND (e IS NULL OR e > $2)",
                &[&key, &now],
            )
            .await?;

        Ok(match row {
            None => Expiry::Absent,
            Some(r) => classify(r.get(0), Utc::now()),
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let source = KeyPattern::new(pattern).regex_source();
        let now = Utc::now();
        let rows = self
            .pool
            .get()
            .await?
            .query(
                "SELECT k FROM kv WHERE k ~ $1 AND (e IS NULL OR e > $2) ORDER BY k",
                &[&source, &now],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let source = KeyPattern::new(pattern).regex_source();
        let now = Utc::now();
        // One extra row tells whether another page follows
        let limit = i64::try_from(count).unwrap_or(i64::MAX - 1) + 1;
        let offset = i64::try_from(cursor).unwrap_or(i64::MAX);

        let rows = self
            .pool
            .get()
            .await?
            .query(
                "SELECT k FROM kv WHERE k ~ $1 AND (e IS NULL OR e > $2) \
                 ORDER BY k LIMIT $3 OFFSET $4",
                &[&source, &now, &limit, &offset],
            )
            .await?;

        let mut page: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        let next = if page.len() > count {
            page.truncate(count);
            cursor + count as u64
        } else {
            0
        };

        debug!(cursor, next, returned = page.len(), "Scan page");
        Ok((next, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let now = Utc::now();
        assert_eq!(classify(None, now), Expiry::Persistent);
        assert_eq!(
            classify(Some(now + chrono::Duration::seconds(5)), now),
            Expiry::Expires(Duration::from_secs(5))
        );
        assert_eq!(classify(Some(now), now), Expiry::Absent);
        assert_eq!(
            classify(Some(now - chrono::Duration::seconds(1)), now),
            Expiry::Absent
        );
    }

    #[test]
    fn test_deadline() {
        let now = Utc::now();
        assert_eq!(
            deadline(now, Duration::from_secs(10)),
            Some(now + chrono::Duration::seconds(10))
        );
        assert_eq!(deadline(now, Duration::ZERO), Some(now));
        assert_eq!(deadline(now, Duration::MAX), None);
    }

    /// Runs against a live database when MULTIKV_TEST_POSTGRES holds a DSN
    #[tokio::test]
    async fn test_live_database_round_trip() {
        let Ok(dsn) = std::env::var("MULTIKV_TEST_POSTGRES") else {
            return;
        };
        let storage = PostgresStorage::connect(&dsn, 4, Duration::ZERO).await.unwrap();
        let prefix = format!("pgtest{}:", std::process::id());
        let key = |k: &str| format!("{prefix}{k}");

        storage.set(&key("a"), Bytes::from_static(b"1"), Duration::ZERO).await.unwrap();
        storage.set(&key("b"), Bytes::from_static(b"2"), Duration::from_millis(200)).await.unwrap();

        assert_eq!(storage.get(&key("a")).await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(storage.expiry(&key("a")).await.unwrap(), Expiry::Persistent);
        assert!(matches!(storage.expiry(&key("b")).await.unwrap(), Expiry::Expires(_)));
        assert_eq!(storage.keys(&prefix).await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(storage.get(&key("b")).await.unwrap().is_none());
        assert!(!storage.del(&key("b")).await.unwrap());
        assert!(storage.del(&key("a")).await.unwrap());
        storage.clear_expired().await.unwrap();
    }
}
