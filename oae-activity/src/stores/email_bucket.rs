//! Email digest bucket rows
//!
//! Recipients waiting for a digest are rows in the `email_buckets` table:
//! partition `bucketId` (`oae-activity-email:{n}:{preference}[:{day}][:{hour}]`),
//! clustering `userId`. The scheduler pages user ids out of a bucket and
//! unqueues them once their mail is sent.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use crate::error::Result;

/// Queue of digest recipients per email bucket
#[async_trait]
pub trait EmailBucketStore: Send + Sync + fmt::Debug {
    /// Add a recipient to a bucket; queueing twice is a no-op
    async fn queue(&self, bucket_id: &str, user_id: &str) -> Result<()>;

    /// Page user ids out of a bucket in clustering order. `start` is the last
    /// user id of the previous page.
    async fn page(
        &self,
        bucket_id: &str,
        start: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<String>, Option<String>)>;

    /// Remove recipients from a bucket
    async fn remove(&self, bucket_id: &str, user_ids: &[String]) -> Result<()>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

/// [`EmailBucketStore`] over the `email_buckets` table
#[derive(Clone)]
pub struct PgEmailBucketStore {
    pool: PgPool,
}

impl PgEmailBucketStore {
    /// Wrap an existing pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS email_buckets (
                bucket_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (bucket_id, user_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl fmt::Debug for PgEmailBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgEmailBucketStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EmailBucketStore for PgEmailBucketStore {
    async fn queue(&self, bucket_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO email_buckets (bucket_id, user_id)
             VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(bucket_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn page(
        &self,
        bucket_id: &str,
        start: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<String>, Option<String>)> {
        let rows = sqlx::query(
            "SELECT user_id FROM email_buckets
             WHERE bucket_id = $1 AND user_id > $2
             ORDER BY user_id
             LIMIT $3",
        )
        .bind(bucket_id)
        .bind(start.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let user_ids: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get("user_id"))
            .collect::<std::result::Result<_, _>>()?;

        let next = if user_ids.len() < limit {
            None
        } else {
            user_ids.last().cloned()
        };
        Ok((user_ids, next))
    }

    async fn remove(&self, bucket_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM email_buckets WHERE bucket_id = $1 AND user_id = ANY($2)")
            .bind(bucket_id)
            .bind(user_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory [`EmailBucketStore`]
#[derive(Debug, Default)]
pub struct MemoryEmailBucketStore {
    buckets: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryEmailBucketStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmailBucketStore for MemoryEmailBucketStore {
    async fn queue(&self, bucket_id: &str, user_id: &str) -> Result<()> {
        self.buckets
            .lock()
            .expect("buckets poisoned")
            .entry(bucket_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn page(
        &self,
        bucket_id: &str,
        start: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<String>, Option<String>)> {
        let buckets = self.buckets.lock().expect("buckets poisoned");
        let user_ids: Vec<String> = buckets
            .get(bucket_id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|id| start.is_none_or(|s| id.as_str() > s))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let next = if user_ids.len() < limit {
            None
        } else {
            user_ids.last().cloned()
        };
        Ok((user_ids, next))
    }

    async fn remove(&self, bucket_id: &str, user_ids: &[String]) -> Result<()> {
        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        if let Some(bucket) = buckets.get_mut(bucket_id) {
            for user_id in user_ids {
                bucket.remove(user_id);
            }
        }
        Ok(())
    }
}
