//! In-memory storage engine with lazy expiry.
//!
//! Provides a thread-safe key-value store with:
//! - Per-key expiration, checked on every read
//! - Bulk purge of expired keys for the background sweep
//! - Deterministic SCAN pagination over keys in lexical order

use super::pattern::KeyPattern;
use super::{Expiry, Result, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Maps {
    /// Stored values, ordered by key
    items: BTreeMap<String, Bytes>,
    /// Absolute expiry per key (absent = never expires)
    expiries: HashMap<String, Instant>,
}

impl Maps {
    fn is_live(&self, key: &str, now: Instant) -> bool {
        self.items.contains_key(key) && self.expiries.get(key).map_or(true, |at| *at > now)
    }

    /// Live keys matching `pattern`, in lexical order
    fn matching<'a>(
        &'a self,
        pattern: &'a regex::Regex,
        now: Instant,
    ) -> impl Iterator<Item = &'a String> + 'a {
        self.items
            .keys()
            .filter(move |k| self.expiries.get(*k).map_or(true, |at| *at > now))
            .filter(move |k| pattern.is_match(k))
    }
}

/// Thread-safe in-memory key-value storage.
///
/// A single reader/writer lock guards both maps; reads share it, writes
/// hold it exclusively for the whole operation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    maps: RwLock<Maps>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        debug!("Initializing memory storage");
        Self::default()
    }
}

/// Deadline `ttl` from `now`. `None` when the deadline is not representable,
/// in which case the key is kept without expiry.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn clear_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut maps = self.maps.write();

        let due: Vec<String> = maps
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &due {
            maps.items.remove(key);
            maps.expiries.remove(key);
        }

        Ok(due.len() as u64)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut maps = self.maps.write();

        maps.items.insert(key.to_string(), value);
        match deadline(now, ttl).filter(|_| !ttl.is_zero()) {
            Some(at) => {
                maps.expiries.insert(key.to_string(), at);
            }
            None => {
                maps.expiries.remove(key);
            }
        }

        trace!(key, ?ttl, "Item stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let maps = self.maps.read();
        if !maps.is_live(key, Instant::now()) {
            return Ok(None);
        }
        Ok(maps.items.get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut maps = self.maps.write();
        if !maps.is_live(key, Instant::now()) {
            return Ok(false);
        }

        maps.items.remove(key);
        maps.expiries.remove(key);
        trace!(key, "Item deleted");
        Ok(true)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut maps = self.maps.write();
        if !maps.is_live(key, now) {
            return Ok(false);
        }

        match deadline(now, ttl) {
            Some(at) => {
                maps.expiries.insert(key.to_string(), at);
            }
            None => {
                maps.expiries.remove(key);
            }
        }
        Ok(true)
    }

    async fn expiry(&self, key: &str) -> Result<Expiry> {
        let now = Instant::now();
        let maps = self.maps.read();
        if !maps.items.contains_key(key) {
            return Ok(Expiry::Absent);
        }

        Ok(match maps.expiries.get(key) {
            None => Expiry::Persistent,
            Some(at) if *at > now => Expiry::Expires(*at - now),
            Some(_) => Expiry::Absent,
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let re = KeyPattern::new(pattern).to_regex()?;
        let maps = self.maps.read();
        Ok(maps.matching(&re, Instant::now()).cloned().collect())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let re = KeyPattern::new(pattern).to_regex()?;
        let maps = self.maps.read();

        let skip = usize::try_from(cursor).unwrap_or(usize::MAX);
        let mut rest = maps.matching(&re, Instant::now()).skip(skip);
        let page: Vec<String> = rest.by_ref().take(count).cloned().collect();

        let next = if rest.next().is_some() {
            cursor + page.len() as u64
        } else {
            0
        };
        Ok((next, page))
    }
}
