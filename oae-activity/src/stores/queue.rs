//! Bucketed queue of routed activities
//!
//! Each bucket is a sorted set at `oae-activity:bucket:{n}` whose members are
//! routed-activity JSON ranked by publish millis, so one collection batch
//! always observes publish order. A routed activity enqueued twice for the
//! same route collapses into one member.

use std::sync::Arc;

use crate::{
    error::Result,
    kv::KeyValue,
    model::RoutedActivity,
};

fn bucket_key(bucket: u32) -> String {
    format!("oae-activity:bucket:{}", bucket)
}

/// One peeked collection batch
#[derive(Debug, Default)]
pub struct QueueBatch {
    /// Parsed routed activities, lowest publish rank first
    pub items: Vec<RoutedActivity>,

    /// Number of raw members peeked, including unparseable ones
    pub raw_count: usize,

    /// Total members in the bucket at peek time
    pub total: u64,
}

/// Persists routed activities in per-bucket sorted sequences by publish time
#[derive(Debug, Clone)]
pub struct QueueStore {
    kv: Arc<dyn KeyValue>,
}

impl QueueStore {
    /// Create a queue store over the key-value store
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    /// Append routed activities to their buckets, ranked by publish millis
    pub async fn enqueue(&self, entries: &[(u32, RoutedActivity)]) -> Result<()> {
        for (bucket, routed) in entries {
            let member = serde_json::to_string(routed)?;
            self.kv
                .zset_add(
                    &bucket_key(*bucket),
                    &[(routed.activity.published_millis, member)],
                )
                .await?;
        }
        Ok(())
    }

    /// Read up to `limit` routed activities from a bucket, lowest publish
    /// rank first. Unparseable members are logged and skipped but still
    /// counted in `raw_count` so the caller's delete advances past them.
    pub async fn peek_batch(&self, bucket: u32, limit: usize) -> Result<QueueBatch> {
        let key = bucket_key(bucket);
        let total = self.kv.zset_card(&key).await?;
        if total == 0 {
            return Ok(QueueBatch::default());
        }

        let members = self
            .kv
            .zset_range(&key, 0, limit as isize - 1)
            .await?;

        let raw_count = members.len();
        let mut items = Vec::with_capacity(raw_count);
        for (member, _) in members {
            match serde_json::from_str::<RoutedActivity>(&member) {
                Ok(routed) => items.push(routed),
                Err(e) => {
                    tracing::warn!(bucket, error = %e, "Dropping unparseable queue entry");
                }
            }
        }

        Ok(QueueBatch {
            items,
            raw_count,
            total,
        })
    }

    /// Delete the first `count` entries of a bucket by rank
    pub async fn delete_batch(&self, bucket: u32, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.kv
            .zset_remove_by_rank(&bucket_key(bucket), 0, count as isize - 1)
            .await
    }
}
