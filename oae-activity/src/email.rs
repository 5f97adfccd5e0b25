//! Email digest scheduling
//!
//! Recipients of email-stream deliveries are queued into buckets keyed by
//! `(bucketNumber, preference, dayOfWeek?, hour?)`, where hour and day are
//! the tenant's configured local delivery time shifted to UTC by the tenant's
//! timezone offset. Collection runs on a polling interval: immediate buckets
//! every cycle, daily buckets when the UTC hour rolls over their hour, weekly
//! buckets additionally within ±1 day of their day so every timezone is
//! covered. A user whose email feed saw an activity inside the grace period
//! is deferred untouched to the next cycle.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    aggregator::aggregate_in_memory,
    bucket::{bucket_number, CollectionLock},
    bus::DeliveredActivitiesEvent,
    clock::Clock,
    config::EmailConfig,
    error::Result,
    kv::KeyValue,
    mailer::{EmailMessage, EmailRecipient, EmailTemplate, Mailer},
    model::{feed_id, Activity, ActivityFormat, EmailPreference, Route, STREAM_EMAIL},
    principal::PrincipalService,
    registry::Registry,
    stores::{AggregateStore, EmailBucketStore, FeedStore},
    tenant::TenantService,
    transform::transform_activities,
};

const BUCKET_PREFIX: &str = "oae-activity-email";
const TEMPLATE_MODULE: &str = "oae-activity-email";

/// Bucket id for a recipient partition: `oae-activity-email:{n}:{preference}[:{day}][:{hour}]`
fn email_bucket_id(
    bucket: u32,
    preference: EmailPreference,
    day: Option<u32>,
    hour: Option<u32>,
) -> String {
    let mut id = format!("{}:{}:{}", BUCKET_PREFIX, bucket, preference.as_str());
    if let Some(day) = day {
        id.push_str(&format!(":{}", day));
    }
    if let Some(hour) = hour {
        id.push_str(&format!(":{}", hour));
    }
    id
}

/// Shift a tenant-local delivery time to UTC. Crossing midnight moves the
/// weekly delivery day accordingly.
fn shifted_delivery(mail_hour: u32, mail_day: u32, offset_hours: i32) -> (u32, u32) {
    let delta = mail_hour as i32 - offset_hours;
    let utc_hour = delta.rem_euclid(24) as u32;
    let day_shift = if delta < 0 {
        -1
    } else if delta >= 24 {
        1
    } else {
        0
    };
    let utc_day = (mail_day as i32 + day_shift).rem_euclid(7) as u32;
    (utc_hour, utc_day)
}

/// Deterministic per-send fingerprint: the recipient plus the sorted
/// `activityType:published` tuples of the contributing activities
fn email_fingerprint(recipient_id: &str, activities: &[Activity]) -> String {
    let mut tuples: Vec<String> = activities
        .iter()
        .map(|a| format!("{}:{}", a.activity_type, a.published_millis))
        .collect();
    tuples.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(recipient_id.as_bytes());
    for tuple in tuples {
        hasher.update(b"\0");
        hasher.update(tuple.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Queues recipients and collects digest buckets
pub struct EmailScheduler {
    registry: Arc<Registry>,
    kv: Arc<dyn KeyValue>,
    buckets: Arc<dyn EmailBucketStore>,
    feeds: Arc<dyn FeedStore>,
    aggregates: AggregateStore,
    mailer: Arc<dyn Mailer>,
    tenants: Arc<dyn TenantService>,
    principals: Arc<dyn PrincipalService>,
    clock: Arc<dyn Clock>,
    config: EmailConfig,
    bucket_count: u32,
    last_cycle_hour: Mutex<Option<u32>>,
}

impl EmailScheduler {
    /// Create an email scheduler
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        kv: Arc<dyn KeyValue>,
        buckets: Arc<dyn EmailBucketStore>,
        feeds: Arc<dyn FeedStore>,
        aggregates: AggregateStore,
        mailer: Arc<dyn Mailer>,
        tenants: Arc<dyn TenantService>,
        principals: Arc<dyn PrincipalService>,
        clock: Arc<dyn Clock>,
        config: EmailConfig,
        bucket_count: u32,
    ) -> Self {
        Self {
            registry,
            kv,
            buckets,
            feeds,
            aggregates,
            mailer,
            tenants,
            principals,
            clock,
            config,
            bucket_count,
            last_cycle_hour: Mutex::new(None),
        }
    }

    /// Queue every recipient of an email-stream delivery into their bucket
    pub async fn on_delivered(&self, event: &DeliveredActivitiesEvent) {
        for (recipient, streams) in event.deliveries.iter() {
            if !streams.contains_key(STREAM_EMAIL) {
                continue;
            }
            if let Err(e) = self.queue_recipient(recipient).await {
                tracing::warn!(recipient = %recipient, error = %e, "Failed to queue email recipient");
            }
        }
    }

    /// The digest recipient for a routed id: a platform user with a known
    /// address, or a raw address synthesised onto the tenant owning its email
    /// domain (invitation flows)
    pub async fn resolve_recipient(
        &self,
        id: &str,
    ) -> Result<Option<(EmailRecipient, EmailPreference)>> {
        if id.contains('@') {
            let Some(tenant) = self.tenants.get_tenant_by_email(id).await? else {
                tracing::debug!(address = id, "No tenant owns this email domain");
                return Ok(None);
            };
            return Ok(Some((
                EmailRecipient {
                    user_id: None,
                    email: id.to_string(),
                    tenant_alias: tenant.alias,
                },
                EmailPreference::Immediate,
            )));
        }

        let Some(principal) = self.principals.get_principal(id).await? else {
            return Ok(None);
        };
        let Some(email) = principal.email else {
            return Ok(None);
        };
        Ok(Some((
            EmailRecipient {
                user_id: Some(principal.id),
                email,
                tenant_alias: principal.tenant_alias,
            },
            principal.email_preference,
        )))
    }

    async fn queue_recipient(&self, id: &str) -> Result<()> {
        let Some((recipient, preference)) = self.resolve_recipient(id).await? else {
            return Ok(());
        };
        if preference == EmailPreference::Never {
            return Ok(());
        }

        let tenant = self.tenants.get_tenant(&recipient.tenant_alias).await?;
        let (mail_hour, mail_day, offset) = match &tenant {
            Some(t) => (t.mail_hour, t.mail_day, t.timezone_offset_hours),
            None => (
                self.config.default_mail_hour,
                self.config.default_mail_day,
                0,
            ),
        };
        let (utc_hour, utc_day) = shifted_delivery(mail_hour, mail_day, offset);

        let n = bucket_number(id, self.bucket_count);
        let bucket_id = match preference {
            EmailPreference::Immediate => email_bucket_id(n, preference, None, None),
            EmailPreference::Daily => email_bucket_id(n, preference, None, Some(utc_hour)),
            EmailPreference::Weekly => {
                email_bucket_id(n, preference, Some(utc_day), Some(utc_hour))
            }
            EmailPreference::Never => return Ok(()),
        };

        self.buckets.queue(&bucket_id, id).await?;
        tracing::debug!(recipient = id, bucket_id = %bucket_id, "Email recipient queued");
        Ok(())
    }

    /// One polling cycle: immediate buckets always, daily/weekly buckets when
    /// the UTC hour has rolled over since the previous cycle
    pub async fn run_cycle(&self) {
        let now: DateTime<Utc> = DateTime::from_timestamp_millis(self.clock.now_millis())
            .unwrap_or_default();
        let current_hour = now.hour();
        let current_day = now.weekday().num_days_from_sunday();

        let hour_rolled = {
            let mut last = self.last_cycle_hour.lock().expect("cycle state poisoned");
            let rolled = *last != Some(current_hour);
            *last = Some(current_hour);
            rolled
        };

        let mut bucket_ids: Vec<(String, EmailPreference)> = Vec::new();
        for n in 0..self.bucket_count {
            bucket_ids.push((
                email_bucket_id(n, EmailPreference::Immediate, None, None),
                EmailPreference::Immediate,
            ));
            if hour_rolled {
                bucket_ids.push((
                    email_bucket_id(n, EmailPreference::Daily, None, Some(current_hour)),
                    EmailPreference::Daily,
                ));
                // Cover all timezones: a weekly bucket within a day of the
                // configured day is eligible
                for delta in [-1_i32, 0, 1] {
                    let day = (current_day as i32 + delta).rem_euclid(7) as u32;
                    bucket_ids.push((
                        email_bucket_id(n, EmailPreference::Weekly, Some(day), Some(current_hour)),
                        EmailPreference::Weekly,
                    ));
                }
            }
        }

        for (bucket_id, preference) in bucket_ids {
            if let Err(e) = self.collect_bucket(&bucket_id, preference).await {
                tracing::warn!(bucket_id = %bucket_id, error = %e, "Email bucket collection failed");
            }
        }
    }

    async fn collect_bucket(&self, bucket_id: &str, preference: EmailPreference) -> Result<()> {
        let lock_key = format!("{}:lock", bucket_id);
        let Some(lock) = CollectionLock::acquire(
            self.kv.clone(),
            lock_key,
            Duration::from_secs(self.config.collection_lock_ttl_secs),
        )
        .await?
        else {
            tracing::debug!(bucket_id, "Email bucket locked by another collector, skipping");
            return Ok(());
        };

        let mut start: Option<String> = None;
        loop {
            let (user_ids, next) = self
                .buckets
                .page(bucket_id, start.as_deref(), self.config.batch_size)
                .await?;

            for user_id in &user_ids {
                if let Err(e) = self.collect_user(bucket_id, user_id, preference).await {
                    // One user's failure must not block the rest of the batch
                    tracing::warn!(
                        user_id = %user_id,
                        bucket_id,
                        error = %e,
                        "Failed to collect email for user"
                    );
                }
            }

            match next {
                Some(next_start) => start = Some(next_start),
                None => break,
            }
        }

        lock.release().await
    }

    async fn collect_user(
        &self,
        bucket_id: &str,
        user_id: &str,
        preference: EmailPreference,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let email_feed = feed_id(user_id, STREAM_EMAIL);

        let since = now - preference.lookback_millis();
        let mut feeds = self
            .feeds
            .batch_get(&[email_feed.clone()], Some(since))
            .await?;
        let activities = feeds.remove(&email_feed).unwrap_or_default();

        if activities.is_empty() {
            // Nothing to send; the queue entry is stale
            self.buckets
                .remove(bucket_id, &[user_id.to_string()])
                .await?;
            return Ok(());
        }

        // Grace: anything fresh defers the whole user to the next cycle,
        // keeping both the feed and the queue entry
        let grace_cutoff = now - self.config.grace_period_millis();
        if activities.iter().any(|a| a.published_millis > grace_cutoff) {
            tracing::debug!(user_id, "Email deferred by grace period");
            return Ok(());
        }

        let Some((recipient, _)) = self.resolve_recipient(user_id).await? else {
            self.buckets
                .remove(bucket_id, &[user_id.to_string()])
                .await?;
            return Ok(());
        };

        self.aggregates.reset_feeds(&[email_feed.clone()]).await?;
        self.buckets
            .remove(bucket_id, &[user_id.to_string()])
            .await?;
        let consumed: Vec<String> = activities.iter().map(|a| a.activity_id.clone()).collect();
        self.feeds.delete(&email_feed, &consumed).await?;

        // Weekly windows may span several stored aggregates; recombine
        let route = Route::new(user_id, STREAM_EMAIL, false);
        let merged = aggregate_in_memory(&self.registry, &route, &activities);
        let rendered =
            transform_activities(&self.registry, ActivityFormat::ActivityStreams, &merged).await;

        let base_url = self
            .tenants
            .get_base_url(&recipient.tenant_alias)
            .await?
            .unwrap_or_default();

        let message = EmailMessage {
            recipient: recipient.clone(),
            template: EmailTemplate {
                module: TEMPLATE_MODULE.to_string(),
                id: preference.as_str().to_string(),
            },
            data: serde_json::json!({
                "recipient": {
                    "id": recipient.user_id,
                    "email": recipient.email,
                },
                "baseUrl": base_url,
                "activities": rendered,
            }),
            fingerprint: email_fingerprint(user_id, &activities),
        };

        if let Err(e) = self.mailer.send(message).await {
            tracing::warn!(user_id, error = %e, "Email send failed");
        } else {
            tracing::debug!(user_id, activities = activities.len(), "Digest email sent");
        }
        Ok(())
    }
}
