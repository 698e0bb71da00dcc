//! Pass-through storage on top of an external Redis-compatible server.
//!
//! Expiry is enforced by the remote server, so there is nothing to sweep.

use super::pattern::KeyPattern;
use super::{Expiry, Result, SetOutcome, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::info;

/// Storage that forwards every operation to a Redis server.
pub struct RedisStorage {
    connection: ConnectionManager,
}

impl RedisStorage {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6380/0`) and verify it answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut connection = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<()>(&mut connection).await?;

        info!("Connected to upstream Redis");
        Ok(Self { connection })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Whether a SET option list asks for the previous value
fn wants_previous(options: &[Bytes]) -> bool {
    options.iter().any(|o| o.eq_ignore_ascii_case(b"GET"))
}

/// Map a PTTL reply: -2 missing, -1 no expiry, otherwise milliseconds left.
/// A reply of 0 is a live key in its final millisecond.
fn pttl_expiry(reply: i64) -> Expiry {
    match reply {
        -1 => Expiry::Persistent,
        ms if ms >= 0 => Expiry::Expires(Duration::from_millis(ms as u64)),
        _ => Expiry::Absent,
    }
}

fn set_outcome(reply: redis::Value, get: bool) -> SetOutcome {
    match reply {
        redis::Value::Nil if get => SetOutcome::Value(None),
        redis::Value::Nil => SetOutcome::NotStored,
        redis::Value::BulkString(previous) => SetOutcome::Value(Some(Bytes::from(previous))),
        _ => SetOutcome::Stored,
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn clear_expired(&self) -> Result<u64> {
        Ok(0)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if !ttl.is_zero() {
            cmd.arg("PX").arg(millis(ttl).max(1));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_forward(&self, key: &str, value: Bytes, options: &[Bytes]) -> Result<SetOutcome> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        for option in options {
            cmd.arg(option.as_ref());
        }
        let reply: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(set_outcome(reply, wants_previous(options)))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        Ok(redis::cmd("DEL").arg(keys).query_async(&mut conn).await?)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn expiry(&self, key: &str) -> Result<Expiry> {
        let mut conn = self.connection.clone();
        let left: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(pttl_expiry(left))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let glob = KeyPattern::new(pattern).redis_glob();
        Ok(redis::cmd("KEYS").arg(glob).query_async(&mut conn).await?)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.connection.clone();
        let glob = KeyPattern::new(pattern).redis_glob();
        Ok(redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(glob)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?)
    }

    async fn key_type(&self, key: &str) -> Result<String> {
        let mut conn = self.connection.clone();
        Ok(redis::cmd("TYPE").arg(key).query_async(&mut conn).await?)
    }
}
