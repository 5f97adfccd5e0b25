//! Append-only per-feed ordered logs
//!
//! A feed is the row-store partition `{ownerId}#{streamType}[#visibility]`
//! clustered by activity, newest first. Ordering is `(publishedMillis,
//! activityId)` descending; paging tokens are opaque encodings of that pair.
//! Every write carries the configured activity TTL.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    clock::Clock,
    error::{Error, Result},
    model::Activity,
};

/// One page of a feed, newest first
#[derive(Debug, Clone)]
pub struct FeedPage {
    /// The activities on this page
    pub items: Vec<Activity>,

    /// Token resuming after the last item, absent when the feed is exhausted
    pub next_token: Option<String>,
}

fn encode_token(published_millis: i64, activity_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", published_millis, activity_id))
}

fn decode_token(token: &str) -> Result<(i64, String)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::InvalidInput("malformed paging token".into()))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidInput("malformed paging token".into()))?;
    let (published, id) = decoded
        .split_once('|')
        .ok_or_else(|| Error::InvalidInput("malformed paging token".into()))?;
    let published = published
        .parse::<i64>()
        .map_err(|_| Error::InvalidInput("malformed paging token".into()))?;
    Ok((published, id.to_string()))
}

/// The activity stream row store
#[async_trait]
pub trait FeedStore: Send + Sync + fmt::Debug {
    /// Upsert activities into a feed. An activity id appears at most once per
    /// feed; a re-append replaces the stored record.
    async fn append(&self, feed_id: &str, activities: &[Activity]) -> Result<()>;

    /// Read one page, newest first
    async fn page(&self, feed_id: &str, start: Option<&str>, limit: usize) -> Result<FeedPage>;

    /// Read many feeds at once, optionally only activities published at or
    /// after `since_millis`, newest first per feed
    async fn batch_get(
        &self,
        feed_ids: &[String],
        since_millis: Option<i64>,
    ) -> Result<HashMap<String, Vec<Activity>>>;

    /// Delete specific activities from a feed
    async fn delete(&self, feed_id: &str, activity_ids: &[String]) -> Result<()>;

    /// Delete a whole feed
    async fn clear(&self, feed_id: &str) -> Result<()>;
}

fn page_token_for(items: &[Activity], limit: usize) -> Option<String> {
    if items.len() < limit {
        return None;
    }
    items
        .last()
        .map(|last| encode_token(last.published_millis, &last.activity_id))
}

// ============================================================================
// Postgres implementation
// ============================================================================

/// [`FeedStore`] over the `activity_streams` table
#[derive(Clone)]
pub struct PgFeedStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    activity_ttl: Duration,
}

impl PgFeedStore {
    /// Wrap an existing pool
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, activity_ttl: Duration) -> Self {
        Self {
            pool,
            clock,
            activity_ttl,
        }
    }

    /// Create the backing table if it does not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS activity_streams (
                activity_stream_id TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                published BIGINT NOT NULL,
                activity JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (activity_stream_id, activity_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS activity_streams_page_idx
             ON activity_streams (activity_stream_id, published DESC, activity_id DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn now_secs(&self) -> f64 {
        self.clock.now_millis() as f64 / 1_000.0
    }

    fn expires_secs(&self) -> f64 {
        (self.clock.now_millis() + self.activity_ttl.as_millis() as i64) as f64 / 1_000.0
    }
}

impl fmt::Debug for PgFeedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgFeedStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn append(&self, feed_id: &str, activities: &[Activity]) -> Result<()> {
        let expires = self.expires_secs();
        for activity in activities {
            let value = serde_json::to_value(activity)?;
            sqlx::query(
                "INSERT INTO activity_streams
                     (activity_stream_id, activity_id, published, activity, expires_at)
                 VALUES ($1, $2, $3, $4, to_timestamp($5))
                 ON CONFLICT (activity_stream_id, activity_id)
                 DO UPDATE SET published = $3, activity = $4, expires_at = to_timestamp($5)",
            )
            .bind(feed_id)
            .bind(&activity.activity_id)
            .bind(activity.published_millis)
            .bind(value)
            .bind(expires)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn page(&self, feed_id: &str, start: Option<&str>, limit: usize) -> Result<FeedPage> {
        let rows = match start {
            Some(token) => {
                let (published, activity_id) = decode_token(token)?;
                sqlx::query(
                    "SELECT activity FROM activity_streams
                     WHERE activity_stream_id = $1
                       AND expires_at > to_timestamp($2)
                       AND (published, activity_id) < ($3, $4)
                     ORDER BY published DESC, activity_id DESC
                     LIMIT $5",
                )
                .bind(feed_id)
                .bind(self.now_secs())
                .bind(published)
                .bind(activity_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT activity FROM activity_streams
                     WHERE activity_stream_id = $1
                       AND expires_at > to_timestamp($2)
                     ORDER BY published DESC, activity_id DESC
                     LIMIT $3",
                )
                .bind(feed_id)
                .bind(self.now_secs())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.try_get("activity")?;
            match serde_json::from_value::<Activity>(value) {
                Ok(activity) => items.push(activity),
                Err(e) => {
                    tracing::warn!(feed_id, error = %e, "Dropping unparseable feed row");
                }
            }
        }

        let next_token = page_token_for(&items, limit);
        Ok(FeedPage { items, next_token })
    }

    async fn batch_get(
        &self,
        feed_ids: &[String],
        since_millis: Option<i64>,
    ) -> Result<HashMap<String, Vec<Activity>>> {
        let since = since_millis.unwrap_or(i64::MIN);
        let rows = sqlx::query(
            "SELECT activity_stream_id, activity FROM activity_streams
             WHERE activity_stream_id = ANY($1)
               AND expires_at > to_timestamp($2)
               AND published >= $3
             ORDER BY published DESC, activity_id DESC",
        )
        .bind(feed_ids)
        .bind(self.now_secs())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut result: HashMap<String, Vec<Activity>> =
            feed_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        for row in rows {
            let feed_id: String = row.try_get("activity_stream_id")?;
            let value: serde_json::Value = row.try_get("activity")?;
            match serde_json::from_value::<Activity>(value) {
                Ok(activity) => {
                    result.entry(feed_id).or_default().push(activity);
                }
                Err(e) => {
                    tracing::warn!(feed_id = %feed_id, error = %e, "Dropping unparseable feed row");
                }
            }
        }
        Ok(result)
    }

    async fn delete(&self, feed_id: &str, activity_ids: &[String]) -> Result<()> {
        if activity_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM activity_streams
             WHERE activity_stream_id = $1 AND activity_id = ANY($2)",
        )
        .bind(feed_id)
        .bind(activity_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, feed_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM activity_streams WHERE activity_stream_id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
struct StoredActivity {
    activity: Activity,
    expires_at_millis: i64,
}

/// In-memory [`FeedStore`] honouring TTLs against the injected clock
#[derive(Debug)]
pub struct MemoryFeedStore {
    clock: Arc<dyn Clock>,
    activity_ttl: Duration,
    feeds: Mutex<HashMap<String, HashMap<String, StoredActivity>>>,
}

impl MemoryFeedStore {
    /// Create an empty store
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, activity_ttl: Duration) -> Self {
        Self {
            clock,
            activity_ttl,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn live_sorted(&self, feed: &HashMap<String, StoredActivity>) -> Vec<Activity> {
        let now = self.clock.now_millis();
        let mut items: Vec<Activity> = feed
            .values()
            .filter(|stored| stored.expires_at_millis > now)
            .map(|stored| stored.activity.clone())
            .collect();
        items.sort_by(|a, b| {
            b.published_millis
                .cmp(&a.published_millis)
                .then_with(|| b.activity_id.cmp(&a.activity_id))
        });
        items
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn append(&self, feed_id: &str, activities: &[Activity]) -> Result<()> {
        let expires_at_millis = self.clock.now_millis() + self.activity_ttl.as_millis() as i64;
        let mut feeds = self.feeds.lock().expect("feeds poisoned");
        let feed = feeds.entry(feed_id.to_string()).or_default();
        for activity in activities {
            feed.insert(
                activity.activity_id.clone(),
                StoredActivity {
                    activity: activity.clone(),
                    expires_at_millis,
                },
            );
        }
        Ok(())
    }

    async fn page(&self, feed_id: &str, start: Option<&str>, limit: usize) -> Result<FeedPage> {
        let after = start.map(decode_token).transpose()?;
        let feeds = self.feeds.lock().expect("feeds poisoned");
        let all = feeds
            .get(feed_id)
            .map(|feed| self.live_sorted(feed))
            .unwrap_or_default();

        let items: Vec<Activity> = all
            .into_iter()
            .filter(|activity| match &after {
                Some((published, id)) => {
                    (activity.published_millis, activity.activity_id.as_str())
                        < (*published, id.as_str())
                }
                None => true,
            })
            .take(limit)
            .collect();

        let next_token = page_token_for(&items, limit);
        Ok(FeedPage { items, next_token })
    }

    async fn batch_get(
        &self,
        feed_ids: &[String],
        since_millis: Option<i64>,
    ) -> Result<HashMap<String, Vec<Activity>>> {
        let feeds = self.feeds.lock().expect("feeds poisoned");
        let mut result = HashMap::new();
        for feed_id in feed_ids {
            let items: Vec<Activity> = feeds
                .get(feed_id)
                .map(|feed| self.live_sorted(feed))
                .unwrap_or_default()
                .into_iter()
                .filter(|activity| {
                    since_millis.is_none_or(|since| activity.published_millis >= since)
                })
                .collect();
            result.insert(feed_id.clone(), items);
        }
        Ok(result)
    }

    async fn delete(&self, feed_id: &str, activity_ids: &[String]) -> Result<()> {
        let mut feeds = self.feeds.lock().expect("feeds poisoned");
        if let Some(feed) = feeds.get_mut(feed_id) {
            for id in activity_ids {
                feed.remove(id);
            }
        }
        Ok(())
    }

    async fn clear(&self, feed_id: &str) -> Result<()> {
        self.feeds
            .lock()
            .expect("feeds poisoned")
            .remove(feed_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ActivityEntity;

    fn activity(published: i64, suffix: &str) -> Activity {
        Activity {
            activity_type: "content-create".to_string(),
            activity_id: format!("{}:{}", published, suffix),
            verb: "create".to_string(),
            published_millis: published,
            actor: ActivityEntity::new("user", "u:cam:alice"),
            object: None,
            target: None,
        }
    }

    fn store() -> (Arc<ManualClock>, MemoryFeedStore) {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryFeedStore::new(clock.clone(), Duration::from_secs(1_209_600));
        (clock, store)
    }

    #[tokio::test]
    async fn test_append_is_upsert_per_activity_id() {
        let (_, store) = store();
        let a = activity(1_000, "aaaaaaaa");
        store.append("f", &[a.clone()]).await.unwrap();
        store.append("f", &[a]).await.unwrap();

        let page = store.page("f", None, 10).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_page_is_newest_first() {
        let (_, store) = store();
        store
            .append(
                "f",
                &[
                    activity(1_000, "aaaaaaaa"),
                    activity(3_000, "cccccccc"),
                    activity(2_000, "bbbbbbbb"),
                ],
            )
            .await
            .unwrap();

        let page = store.page("f", None, 10).await.unwrap();
        let published: Vec<i64> = page.items.iter().map(|a| a.published_millis).collect();
        assert_eq!(published, vec![3_000, 2_000, 1_000]);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_paging_round_trip_covers_whole_feed() {
        let (_, store) = store();
        let all: Vec<Activity> = (1..=7)
            .map(|i| activity(i * 1_000, "aaaaaaaa"))
            .collect();
        store.append("f", &all).await.unwrap();

        let mut collected = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = store.page("f", token.as_deref(), 3).await.unwrap();
            collected.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        assert_eq!(collected.len(), 7);
        // Strictly descending publish time across the concatenated pages
        for pair in collected.windows(2) {
            assert!(pair[0].published_millis > pair[1].published_millis);
        }
    }

    #[tokio::test]
    async fn test_page_breaks_publish_ties_on_activity_id() {
        let (_, store) = store();
        store
            .append(
                "f",
                &[activity(1_000, "aaaaaaaa"), activity(1_000, "bbbbbbbb")],
            )
            .await
            .unwrap();

        let first = store.page("f", None, 1).await.unwrap();
        assert_eq!(first.items[0].activity_id, "1000:bbbbbbbb");

        let second = store
            .page("f", first.next_token.as_deref(), 1)
            .await
            .unwrap();
        assert_eq!(second.items[0].activity_id, "1000:aaaaaaaa");
    }

    #[tokio::test]
    async fn test_activities_expire_by_ttl() {
        let (clock, store) = store();
        store.append("f", &[activity(1_000, "aaaaaaaa")]).await.unwrap();

        clock.advance(1_209_600_001);
        let page = store.page("f", None, 10).await.unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_batch_get_since_filter() {
        let (_, store) = store();
        store
            .append(
                "f1",
                &[activity(1_000, "aaaaaaaa"), activity(5_000, "bbbbbbbb")],
            )
            .await
            .unwrap();

        let result = store
            .batch_get(&["f1".to_string(), "f2".to_string()], Some(2_000))
            .await
            .unwrap();
        assert_eq!(result["f1"].len(), 1);
        assert_eq!(result["f1"][0].published_millis, 5_000);
        assert!(result["f2"].is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_, store) = store();
        store
            .append(
                "f",
                &[activity(1_000, "aaaaaaaa"), activity(2_000, "bbbbbbbb")],
            )
            .await
            .unwrap();

        store
            .delete("f", &["1000:aaaaaaaa".to_string()])
            .await
            .unwrap();
        assert_eq!(store.page("f", None, 10).await.unwrap().items.len(), 1);

        store.clear("f").await.unwrap();
        assert!(store.page("f", None, 10).await.unwrap().items.is_empty());
    }

    #[test]
    fn test_token_round_trip() {
        let token = encode_token(5_000, "5000:abc");
        let (published, id) = decode_token(&token).unwrap();
        assert_eq!(published, 5_000);
        assert_eq!(id, "5000:abc");
        assert!(decode_token("!!!").is_err());
    }
}
