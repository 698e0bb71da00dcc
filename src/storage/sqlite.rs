//! SQLite storage engine.
//!
//! Same table layout and statements as the PostgreSQL engine, with expiry
//! kept as Unix milliseconds. Key patterns use a `regexp` SQL function
//! registered on the connection, backed by the `regex` crate.

use super::pattern::{self, KeyPattern};
use super::{Expiry, Result, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    k TEXT PRIMARY KEY,
    v BLOB NOT NULL,
    e INTEGER
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS kv_e_idx ON kv (e);
"#;

/// Storage backed by a single SQLite connection.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`; `:memory:` keeps it in RAM.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };

        conn.call(|conn| {
            // journal_mode answers with the resulting mode
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            register_regexp(conn)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        info!(path, "SQLite schema ready");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Register `regexp(pattern, text)`, which SQLite calls for `text REGEXP pattern`.
/// The compiled pattern is cached per statement.
fn register_regexp(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<regex::Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(pattern::compile(vr.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(re.is_match(text))
        },
    )
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Absolute deadline in Unix milliseconds, `None` when not representable
fn deadline(now: i64, ttl: Duration) -> Option<i64> {
    let ttl = i64::try_from(ttl.as_millis()).ok()?;
    now.checked_add(ttl)
}

fn classify(expires_at: Option<i64>, now: i64) -> Expiry {
    match expires_at {
        None => Expiry::Persistent,
        Some(at) if at > now => Expiry::Expires(Duration::from_millis((at - now) as u64)),
        Some(_) => Expiry::Absent,
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn clear_expired(&self) -> Result<u64> {
        let now = now_millis();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM kv WHERE e <= ?1", params![now])?))
            .await?;
        Ok(removed as u64)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            deadline(now_millis(), ttl)
        };
        let key = key.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO kv (k, v, e) VALUES (?1, ?2, ?3) \
                     ON CONFLICT (k) DO UPDATE SET v = excluded.v, e = excluded.e",
                )?;
                stmt.execute(params![key, value.as_ref(), expires_at])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = now_millis();
        let key = key.to_string();

        let value = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT v FROM kv WHERE k = ?1 AND (e IS NULL OR e > ?2)",
                )?;
                Ok(stmt
                    .query_row(params![key, now], |row| row.get::<_, Vec<u8>>(0))
                    .optional()?)
            })
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = now_millis();
        let key = key.to_string();

        let affected = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "DELETE FROM kv WHERE k = ?1 AND (e IS NULL OR e > ?2)",
                )?;
                Ok(stmt.execute(params![key, now])?)
            })
            .await?;
        Ok(affected > 0)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        let expires_at = deadline(now, ttl);
        let key = key.to_string();

        let affected = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "UPDATE kv SET e = ?2 WHERE k = ?1 AND (e IS NULL OR e > ?3)",
                )?;
                Ok(stmt.execute(params![key, expires_at, now])?)
            })
            .await?;
        Ok(affected > 0)
    }

    async fn expiry(&self, key: &str) -> Result<Expiry> {
        let now = now_millis();
        let key = key.to_string();

        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT e FROM kv WHERE k = ?1 AND (e IS NULL OR e > ?2)",
                )?;
                Ok(stmt
                    .query_row(params![key, now], |row| row.get::<_, Option<i64>>(0))
                    .optional()?)
            })
            .await?;

        Ok(match row {
            None => Expiry::Absent,
            Some(expires_at) => classify(expires_at, now_millis()),
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let source = KeyPattern::new(pattern).regex_source();
        let now = now_millis();

        let keys = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT k FROM kv WHERE k REGEXP ?1 AND (e IS NULL OR e > ?2) ORDER BY k",
                )?;
                let rows = stmt.query_map(params![source, now], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(keys)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let source = KeyPattern::new(pattern).regex_source();
        let now = now_millis();
        // One extra row tells whether another page follows
        let limit = i64::try_from(count).unwrap_or(i64::MAX - 1) + 1;
        let offset = i64::try_from(cursor).unwrap_or(i64::MAX);

        let mut page = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT k FROM kv WHERE k REGEXP ?1 AND (e IS NULL OR e > ?2) \
                     ORDER BY k LIMIT ?3 OFFSET ?4",
                )?;
                let rows = stmt.query_map(params![source, now, limit, offset], |row| {
                    row.get::<_, String>(0)
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;

        let next = if page.len() > count {
            page.truncate(count);
            cursor + count as u64
        } else {
            0
        };
        Ok((next, page))
    }
}
