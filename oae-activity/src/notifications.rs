//! Per-user notification bookkeeping
//!
//! The unread counter is an incrementally maintained cache of the
//! notification feed's tail: every delivered notification bumps it by the
//! number of newly created activities, and marking read resets it. The feed
//! stays authoritative if the two diverge.

use std::sync::Arc;

use crate::{
    bus::DeliveredActivitiesEvent,
    clock::Clock,
    error::Result,
    kv::KeyValue,
    model::{feed_id, EmailPreference, STREAM_EMAIL, STREAM_NOTIFICATION},
    principal::PrincipalService,
    stores::{AggregateStore, FeedStore},
};

fn count_key(user_id: &str) -> String {
    format!("oae-activity:notification-count:{}", user_id)
}

fn last_read_key(user_id: &str) -> String {
    format!("oae-activity:notification-last-read:{}", user_id)
}

/// Maintains unread counters and last-read timestamps
pub struct NotificationManager {
    kv: Arc<dyn KeyValue>,
    aggregates: AggregateStore,
    feeds: Arc<dyn FeedStore>,
    principals: Arc<dyn PrincipalService>,
    clock: Arc<dyn Clock>,
}

impl NotificationManager {
    /// Create a notification manager
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValue>,
        aggregates: AggregateStore,
        feeds: Arc<dyn FeedStore>,
        principals: Arc<dyn PrincipalService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kv,
            aggregates,
            feeds,
            principals,
            clock,
        }
    }

    /// Bump unread counters for every notification delivery in the event
    pub async fn on_delivered(&self, event: &DeliveredActivitiesEvent) {
        for (recipient, streams) in event.deliveries.iter() {
            let Some(delivery) = streams.get(STREAM_NOTIFICATION) else {
                continue;
            };
            if delivery.num_new_activities == 0 {
                continue;
            }
            if let Err(e) = self
                .kv
                .incr_by(&count_key(recipient), delivery.num_new_activities as i64)
                .await
            {
                tracing::warn!(
                    user_id = %recipient,
                    error = %e,
                    "Failed to bump unread notification counter"
                );
            }
        }
    }

    /// Current unread count for a user
    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .kv
            .get(&count_key(user_id))
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// When the user last marked their notifications read
    pub async fn last_read_millis(&self, user_id: &str) -> Result<Option<i64>> {
        Ok(self
            .kv
            .get(&last_read_key(user_id))
            .await?
            .and_then(|value| value.parse().ok()))
    }

    /// Mark a user's notifications read: reset the counter and persist the
    /// read time (both required), then reset the notification feed's
    /// aggregation and clear the email feed of IMMEDIATE users (best-effort).
    /// Returns the persisted last-read time.
    pub async fn mark_read(&self, user_id: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        self.kv.set(&count_key(user_id), "0", None).await?;
        self.kv
            .set(&last_read_key(user_id), &now.to_string(), None)
            .await?;

        let notification_feed = feed_id(user_id, STREAM_NOTIFICATION);
        if let Err(e) = self.aggregates.reset_feeds(&[notification_feed]).await {
            tracing::warn!(
                user_id,
                error = %e,
                "Failed to reset notification aggregation on mark-read"
            );
        }

        match self.email_preference(user_id).await {
            Ok(Some(EmailPreference::Immediate)) => {
                // A digest of already-read notifications would be redundant
                if let Err(e) = self.feeds.clear(&feed_id(user_id, STREAM_EMAIL)).await {
                    tracing::warn!(
                        user_id,
                        error = %e,
                        "Failed to clear email feed on mark-read"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to load email preference on mark-read");
            }
        }

        Ok(now)
    }

    async fn email_preference(&self, user_id: &str) -> Result<Option<EmailPreference>> {
        Ok(self
            .principals
            .get_principal(user_id)
            .await?
            .map(|principal| principal.email_preference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StreamDelivery;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKeyValue;
    use crate::model::{Activity, ActivityEntity, Visibility};
    use crate::principal::{Principal, StaticPrincipalService};
    use crate::stores::MemoryFeedStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn activity(published: i64) -> Activity {
        Activity {
            activity_type: "content-share".to_string(),
            activity_id: format!("{}:aaaaaaaa", published),
            verb: "share".to_string(),
            published_millis: published,
            actor: ActivityEntity::new("user", "u:cam:alice"),
            object: None,
            target: None,
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        feeds: Arc<MemoryFeedStore>,
        principals: Arc<StaticPrincipalService>,
        manager: NotificationManager,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(1_000_000);
        let kv: Arc<dyn KeyValue> = Arc::new(MemoryKeyValue::new(clock.clone()));
        let aggregates = AggregateStore::new(
            kv.clone(),
            clock.clone(),
            Duration::from_secs(3_600),
            Duration::from_secs(86_400),
        );
        let feeds = Arc::new(MemoryFeedStore::new(
            clock.clone(),
            Duration::from_secs(1_209_600),
        ));
        let principals = Arc::new(StaticPrincipalService::new());
        let manager = NotificationManager::new(
            kv,
            aggregates,
            feeds.clone(),
            principals.clone(),
            clock.clone(),
        );
        Harness {
            clock,
            feeds,
            principals,
            manager,
        }
    }

    fn user(id: &str, preference: EmailPreference) -> Principal {
        Principal {
            id: id.to_string(),
            display_name: "User".to_string(),
            visibility: Visibility::Public,
            email: Some("user@cam.example".to_string()),
            email_preference: preference,
            is_group: false,
            tenant_alias: "cam".to_string(),
        }
    }

    fn delivered(recipient: &str, stream: &str, num_new: usize) -> DeliveredActivitiesEvent {
        let mut streams = HashMap::new();
        streams.insert(
            stream.to_string(),
            StreamDelivery {
                activities: vec![activity(1_000)],
                num_new_activities: num_new,
            },
        );
        let mut deliveries = HashMap::new();
        deliveries.insert(recipient.to_string(), streams);
        DeliveredActivitiesEvent {
            deliveries: Arc::new(deliveries),
        }
    }

    #[tokio::test]
    async fn test_counter_tracks_new_notifications() {
        let h = harness();
        h.manager
            .on_delivered(&delivered("u:cam:bob", "notification", 1))
            .await;
        h.manager
            .on_delivered(&delivered("u:cam:bob", "notification", 2))
            .await;

        assert_eq!(h.manager.unread_count("u:cam:bob").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_updates_do_not_bump_counter() {
        let h = harness();
        h.manager
            .on_delivered(&delivered("u:cam:bob", "notification", 0))
            .await;
        assert_eq!(h.manager.unread_count("u:cam:bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_other_streams_do_not_count() {
        let h = harness();
        h.manager
            .on_delivered(&delivered("u:cam:bob", "activity", 5))
            .await;
        assert_eq!(h.manager.unread_count("u:cam:bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_resets_and_persists() {
        let h = harness();
        h.principals.insert(user("u:cam:bob", EmailPreference::Daily));
        h.manager
            .on_delivered(&delivered("u:cam:bob", "notification", 4))
            .await;

        let read_at = h.manager.mark_read("u:cam:bob").await.unwrap();
        assert_eq!(read_at, 1_000_000);
        assert_eq!(h.manager.unread_count("u:cam:bob").await.unwrap(), 0);
        assert_eq!(
            h.manager.last_read_millis("u:cam:bob").await.unwrap(),
            Some(1_000_000)
        );
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let h = harness();
        h.principals.insert(user("u:cam:bob", EmailPreference::Daily));
        h.manager
            .on_delivered(&delivered("u:cam:bob", "notification", 1))
            .await;

        let first = h.manager.mark_read("u:cam:bob").await.unwrap();
        h.clock.advance(5_000);
        let second = h.manager.mark_read("u:cam:bob").await.unwrap();

        assert!(second >= first);
        assert_eq!(h.manager.unread_count("u:cam:bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_clears_email_feed_for_immediate_users() {
        let h = harness();
        h.principals
            .insert(user("u:cam:bob", EmailPreference::Immediate));
        h.feeds
            .append("u:cam:bob#email", &[activity(1_000)])
            .await
            .unwrap();

        h.manager.mark_read("u:cam:bob").await.unwrap();
        assert!(h
            .feeds
            .page("u:cam:bob#email", None, 10)
            .await
            .unwrap()
            .items
            .is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_keeps_email_feed_for_digest_users() {
        let h = harness();
        h.principals.insert(user("u:cam:bob", EmailPreference::Weekly));
        h.feeds
            .append("u:cam:bob#email", &[activity(1_000)])
            .await
            .unwrap();

        h.manager.mark_read("u:cam:bob").await.unwrap();
        assert_eq!(
            h.feeds
                .page("u:cam:bob#email", None, 10)
                .await
                .unwrap()
                .items
                .len(),
            1
        );
    }

}
