//! Key-value store interface
//!
//! The pipeline's queue, aggregate state, counters and locks live in a
//! key-value store with three value shapes: blobs, hashes and sorted sets.
//! [`RedisKeyValue`] is the production implementation over a deadpool
//! connection pool; [`MemoryKeyValue`] backs tests and single-process dev
//! runs, honouring TTLs against the injected clock.

use async_trait::async_trait;
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    clock::Clock,
    config::RedisConfig,
    error::{Error, Result},
};

/// String-keyed store with blobs, hashes, sorted sets, counters and TTLs
#[async_trait]
pub trait KeyValue: Send + Sync + fmt::Debug {
    /// Read one blob
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read many blobs; missing keys yield `None` at their position
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write a blob, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write a blob only if the key does not exist; returns whether the
    /// write happened. The lock primitive.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys of any shape
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Atomically add to an integer blob, creating it at zero
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Reset a key's TTL
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Merge fields into a hash
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Read a whole hash; an absent key yields an empty map
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Add members to a sorted set, updating scores of existing members
    async fn zset_add(&self, key: &str, entries: &[(i64, String)]) -> Result<()>;

    /// Number of members in a sorted set
    async fn zset_card(&self, key: &str) -> Result<u64>;

    /// Members by ascending rank, with scores. Negative indices count from
    /// the end, `-1` being the last member.
    async fn zset_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<(String, i64)>>;

    /// Members whose score lies in `[min, max]`, ascending
    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>>;

    /// Remove specific members
    async fn zset_remove(&self, key: &str, members: &[String]) -> Result<()>;

    /// Remove members by ascending rank range
    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Remove members whose score lies in `[min, max]`
    async fn zset_remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<()>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Create a Redis connection pool, doubling the backoff between attempts
/// until the configured retry allowance runs out
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempts_left = config.max_retries;
    let mut backoff = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                tracing::info!(
                    max_connections = config.max_connections,
                    "Redis connection pool ready"
                );
                return Ok(pool);
            }
            Err(e) if attempts_left > 0 => {
                attempts_left -= 1;
                tracing::warn!(
                    error = %e,
                    retry_in = ?backoff,
                    attempts_left,
                    "Redis pool creation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                tracing::error!(error = %e, "Redis pool creation failed, out of retries");
                return Err(e);
            }
        }
    }
}

async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let timeout = Duration::from_secs(config.connection_timeout_secs);
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| Error::Storage(format!("Redis pool setup: {}", e)))?
        .max_size(config.max_connections)
        .create_timeout(Some(timeout))
        .wait_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Storage(format!("Redis pool setup: {}", e)))?;

    // One checkout proves the server is actually reachable
    pool.get()
        .await
        .map_err(|e| Error::Storage(format!("Redis probe: {}", e)))?;

    Ok(pool)
}

/// [`KeyValue`] over a Redis connection pool
#[derive(Clone)]
pub struct RedisKeyValue {
    pool: Pool,
}

impl RedisKeyValue {
    /// Wrap an existing pool
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Bootstrap a pool from configuration and wrap it
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Storage(format!("Redis pool exhausted: {}", e)))
    }
}

impl fmt::Debug for RedisKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKeyValue").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValue for RedisKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn zset_add(&self, key: &str, entries: &[(i64, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (score, member) in entries {
            cmd.arg(score).arg(member);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zset_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn().await?;
        let flat: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        let mut entries = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
            let score = score
                .parse::<f64>()
                .map_err(|e| Error::Storage(format!("Bad sorted-set score: {}", e)))?;
            entries.push((member, score as i64));
        }
        Ok(entries)
    }

    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zset_remove(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zset_remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
enum Shape {
    Blob(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    shape: Shape,
    expires_at_millis: Option<i64>,
}

/// In-memory [`KeyValue`] honouring TTLs against the injected clock
#[derive(Debug)]
pub struct MemoryKeyValue {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyValue {
    /// Create an empty store reading time from the given clock
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn ttl_deadline(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.now_millis() + ttl.as_millis() as i64)
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> T) -> T {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("kv poisoned");
        entries.retain(|_, entry| entry.expires_at_millis.is_none_or(|at| at > now));
        f(&mut entries, now)
    }

    fn sorted(set: &HashMap<String, i64>) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn rank_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
        let len = len as isize;
        let mut start = if start < 0 { len + start } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        start = start.max(0);
        stop = stop.min(len - 1);
        if len == 0 || start > stop {
            None
        } else {
            Some((start as usize, stop as usize))
        }
    }
}

#[async_trait]
impl KeyValue for MemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries, _| {
            Ok(entries.get(key).and_then(|entry| match &entry.shape {
                Shape::Blob(value) => Some(value.clone()),
                _ => None,
            }))
        })
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.with_entries(|entries, _| {
            Ok(keys
                .iter()
                .map(|key| {
                    entries.get(key).and_then(|entry| match &entry.shape {
                        Shape::Blob(value) => Some(value.clone()),
                        _ => None,
                    })
                })
                .collect())
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at_millis = self.ttl_deadline(ttl);
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    shape: Shape::Blob(value.to_string()),
                    expires_at_millis,
                },
            );
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let expires_at_millis = self.ttl_deadline(Some(ttl));
        self.with_entries(|entries, _| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    shape: Shape::Blob(value.to_string()),
                    expires_at_millis,
                },
            );
            Ok(true)
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.with_entries(|entries, _| {
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_entries(|entries, _| {
            let current = match entries.get(key) {
                Some(Entry {
                    shape: Shape::Blob(value),
                    ..
                }) => value
                    .parse::<i64>()
                    .map_err(|_| Error::Storage(format!("{} is not an integer", key)))?,
                Some(_) => return Err(Error::Storage(format!("{} is not a blob", key))),
                None => 0,
            };
            let next = current + delta;
            let expires_at_millis = entries.get(key).and_then(|e| e.expires_at_millis);
            entries.insert(
                key.to_string(),
                Entry {
                    shape: Shape::Blob(next.to_string()),
                    expires_at_millis,
                },
            );
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let deadline = self.ttl_deadline(Some(ttl));
        self.with_entries(|entries, _| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at_millis = deadline;
            }
            Ok(())
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                shape: Shape::Hash(HashMap::new()),
                expires_at_millis: None,
            });
            match &mut entry.shape {
                Shape::Hash(map) => {
                    for (field, value) in fields {
                        map.insert(field.clone(), value.clone());
                    }
                    Ok(())
                }
                _ => Err(Error::Storage(format!("{} is not a hash", key))),
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_entries(|entries, _| match entries.get(key) {
            Some(Entry {
                shape: Shape::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(_) => Err(Error::Storage(format!("{} is not a hash", key))),
            None => Ok(HashMap::new()),
        })
    }

    async fn zset_add(&self, key: &str, new_entries: &[(i64, String)]) -> Result<()> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                shape: Shape::ZSet(HashMap::new()),
                expires_at_millis: None,
            });
            match &mut entry.shape {
                Shape::ZSet(set) => {
                    for (score, member) in new_entries {
                        set.insert(member.clone(), *score);
                    }
                    Ok(())
                }
                _ => Err(Error::Storage(format!("{} is not a sorted set", key))),
            }
        })
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        self.with_entries(|entries, _| match entries.get(key) {
            Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(Error::Storage(format!("{} is not a sorted set", key))),
            None => Ok(0),
        })
    }

    async fn zset_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        self.with_entries(|entries, _| match entries.get(key) {
            Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) => {
                let sorted = Self::sorted(set);
                Ok(match Self::rank_bounds(sorted.len(), start, stop) {
                    Some((lo, hi)) => sorted[lo..=hi].to_vec(),
                    None => Vec::new(),
                })
            }
            Some(_) => Err(Error::Storage(format!("{} is not a sorted set", key))),
            None => Ok(Vec::new()),
        })
    }

    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        self.with_entries(|entries, _| match entries.get(key) {
            Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) => Ok(Self::sorted(set)
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .map(|(member, _)| member)
                .collect()),
            Some(_) => Err(Error::Storage(format!("{} is not a sorted set", key))),
            None => Ok(Vec::new()),
        })
    }

    async fn zset_remove(&self, key: &str, members: &[String]) -> Result<()> {
        self.with_entries(|entries, _| {
            if let Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) = entries.get_mut(key)
            {
                for member in members {
                    set.remove(member);
                }
            }
            Ok(())
        })
    }

    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_entries(|entries, _| {
            if let Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) = entries.get_mut(key)
            {
                let sorted = Self::sorted(set);
                if let Some((lo, hi)) = Self::rank_bounds(sorted.len(), start, stop) {
                    for (member, _) in &sorted[lo..=hi] {
                        set.remove(member);
                    }
                }
            }
            Ok(())
        })
    }

    async fn zset_remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<()> {
        self.with_entries(|entries, _| {
            if let Some(Entry {
                shape: Shape::ZSet(set),
                ..
            }) = entries.get_mut(key)
            {
                set.retain(|_, score| *score < min || *score > max);
            }
            Ok(())
        })
    }
}
