//! Pipeline state assembly
//!
//! [`ActivityState`] owns every store, the frozen registry, the internal bus
//! and the pipeline components, and is cloned into handlers and workers.
//! [`ActivityStateBuilder`] wires production implementations (Redis,
//! Postgres, NATS) from configuration, or accepts injected implementations —
//! tests run the whole pipeline over the in-memory ones.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    aggregator::Aggregator,
    bus::PipelineBus,
    clock::{Clock, SystemClock},
    config::Config,
    database,
    email::EmailScheduler,
    error::{Error, Result},
    kv::{KeyValue, RedisKeyValue},
    mailer::{Mailer, MemoryMailer},
    model::ActivitySeed,
    notifications::NotificationManager,
    principal::{PrincipalService, StaticPrincipalService},
    pubsub::{NatsPubSub, PubSub},
    push::{PushChannels, PushPublisher, PushService},
    registry::Registry,
    router::Router,
    stores::{
        AggregateStore, EmailBucketStore, FeedStore, PgEmailBucketStore, PgFeedStore, QueueStore,
    },
    tenant::{StaticTenantService, TenantService},
};

struct StateInner {
    config: Config,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    kv: Arc<dyn KeyValue>,
    feeds: Arc<dyn FeedStore>,
    email_buckets: Arc<dyn EmailBucketStore>,
    pubsub: Arc<dyn PubSub>,
    mailer: Arc<dyn Mailer>,
    tenants: Arc<dyn TenantService>,
    principals: Arc<dyn PrincipalService>,
    bus: PipelineBus,
    queue: QueueStore,
    aggregates: AggregateStore,
    router: Router,
    aggregator: Arc<Aggregator>,
    notifications: NotificationManager,
    email: Arc<EmailScheduler>,
    push: Arc<PushService>,
    push_publisher: Arc<PushPublisher>,
    seed_tx: mpsc::Sender<ActivitySeed>,
    seed_rx: Mutex<Option<mpsc::Receiver<ActivitySeed>>>,
}

/// Shared handle to the assembled pipeline
#[derive(Clone)]
pub struct ActivityState {
    inner: Arc<StateInner>,
}

impl fmt::Debug for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityState")
            .field("service", &self.inner.config.service.name)
            .finish_non_exhaustive()
    }
}

impl ActivityState {
    /// Start building state
    #[must_use]
    pub fn builder() -> ActivityStateBuilder {
        ActivityStateBuilder::default()
    }

    /// Validate a seed and hand it to the router channel. Input errors fail
    /// the caller synchronously; routing itself is asynchronous.
    pub async fn post_activity(&self, seed: ActivitySeed) -> Result<()> {
        seed.validate()?;
        if self.inner.registry.activity_type(&seed.activity_type).is_none() {
            return Err(Error::InvalidInput(format!(
                "unregistered activity type {}",
                seed.activity_type
            )));
        }
        self.inner
            .seed_tx
            .send(seed)
            .await
            .map_err(|_| Error::Storage("router channel closed".into()))
    }

    /// The loaded configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The frozen registry
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// The injected clock
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// The key-value store
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KeyValue> {
        &self.inner.kv
    }

    /// The feed store
    #[must_use]
    pub fn feeds(&self) -> &Arc<dyn FeedStore> {
        &self.inner.feeds
    }

    /// The email bucket store
    #[must_use]
    pub fn email_buckets(&self) -> &Arc<dyn EmailBucketStore> {
        &self.inner.email_buckets
    }

    /// The pub/sub bus
    #[must_use]
    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.inner.pubsub
    }

    /// The mail transport
    #[must_use]
    pub fn mailer(&self) -> &Arc<dyn Mailer> {
        &self.inner.mailer
    }

    /// The tenant directory
    #[must_use]
    pub fn tenants(&self) -> &Arc<dyn TenantService> {
        &self.inner.tenants
    }

    /// The principal directory
    #[must_use]
    pub fn principals(&self) -> &Arc<dyn PrincipalService> {
        &self.inner.principals
    }

    /// The internal event bus
    #[must_use]
    pub fn bus(&self) -> &PipelineBus {
        &self.inner.bus
    }

    /// The queue store
    #[must_use]
    pub fn queue(&self) -> &QueueStore {
        &self.inner.queue
    }

    /// The aggregate store
    #[must_use]
    pub fn aggregates(&self) -> &AggregateStore {
        &self.inner.aggregates
    }

    /// The routing stage
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// The aggregation engine
    #[must_use]
    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.inner.aggregator.clone()
    }

    /// Notification bookkeeping
    #[must_use]
    pub fn notifications(&self) -> &NotificationManager {
        &self.inner.notifications
    }

    /// The email scheduler
    #[must_use]
    pub fn email_scheduler(&self) -> Arc<EmailScheduler> {
        self.inner.email.clone()
    }

    /// The push service
    #[must_use]
    pub fn push_service(&self) -> Arc<PushService> {
        self.inner.push.clone()
    }

    /// The bus-to-pub/sub push bridge
    #[must_use]
    pub fn push_publisher(&self) -> Arc<PushPublisher> {
        self.inner.push_publisher.clone()
    }

    /// Take the router ingest receiver. The service worker calls this once
    /// at startup.
    #[must_use]
    pub fn take_seed_receiver(&self) -> Option<mpsc::Receiver<ActivitySeed>> {
        self.inner.seed_rx.lock().expect("seed receiver poisoned").take()
    }
}

/// Builder wiring configuration and implementations into [`ActivityState`]
#[derive(Default)]
pub struct ActivityStateBuilder {
    config: Option<Config>,
    registry: Option<Registry>,
    clock: Option<Arc<dyn Clock>>,
    kv: Option<Arc<dyn KeyValue>>,
    feeds: Option<Arc<dyn FeedStore>>,
    email_buckets: Option<Arc<dyn EmailBucketStore>>,
    pubsub: Option<Arc<dyn PubSub>>,
    mailer: Option<Arc<dyn Mailer>>,
    tenants: Option<Arc<dyn TenantService>>,
    principals: Option<Arc<dyn PrincipalService>>,
}

impl ActivityStateBuilder {
    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the frozen registry
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Inject a clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Inject a key-value store
    #[must_use]
    pub fn key_value(mut self, kv: Arc<dyn KeyValue>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Inject a feed store
    #[must_use]
    pub fn feed_store(mut self, feeds: Arc<dyn FeedStore>) -> Self {
        self.feeds = Some(feeds);
        self
    }

    /// Inject an email bucket store
    #[must_use]
    pub fn email_bucket_store(mut self, email_buckets: Arc<dyn EmailBucketStore>) -> Self {
        self.email_buckets = Some(email_buckets);
        self
    }

    /// Inject a pub/sub bus
    #[must_use]
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Inject a mail transport
    #[must_use]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Inject a tenant directory
    #[must_use]
    pub fn tenant_service(mut self, tenants: Arc<dyn TenantService>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    /// Inject a principal directory
    #[must_use]
    pub fn principal_service(mut self, principals: Arc<dyn PrincipalService>) -> Self {
        self.principals = Some(principals);
        self
    }

    /// Assemble the state, connecting to Redis, Postgres and NATS for any
    /// store that was not injected
    pub async fn build(self) -> Result<ActivityState> {
        let config = self.config.unwrap_or_default();
        let registry = Arc::new(
            self.registry
                .ok_or_else(|| Error::InvalidInput("a registry is required".into()))?,
        );

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let tenants: Arc<dyn TenantService> = self
            .tenants
            .unwrap_or_else(|| Arc::new(StaticTenantService::new(config.tenants.clone())));
        let principals: Arc<dyn PrincipalService> = self
            .principals
            .unwrap_or_else(|| Arc::new(StaticPrincipalService::new()));
        let mailer: Arc<dyn Mailer> = self.mailer.unwrap_or_else(|| Arc::new(MemoryMailer::new()));

        let kv: Arc<dyn KeyValue> = match self.kv {
            Some(kv) => kv,
            None => Arc::new(RedisKeyValue::connect(&config.redis).await?),
        };

        let pubsub: Arc<dyn PubSub> = match self.pubsub {
            Some(pubsub) => pubsub,
            None => Arc::new(NatsPubSub::connect(&config.nats).await?),
        };

        // One Postgres pool backs both row stores when neither was injected
        let pool = if self.feeds.is_none() || self.email_buckets.is_none() {
            Some(database::create_pool(&config.database).await?)
        } else {
            None
        };

        let activity_ttl = Duration::from_secs(config.pipeline.activity_ttl_secs);
        let feeds: Arc<dyn FeedStore> = match self.feeds {
            Some(feeds) => feeds,
            None => {
                let store = PgFeedStore::new(
                    pool.clone().expect("pool exists when feeds are defaulted"),
                    clock.clone(),
                    activity_ttl,
                );
                store.migrate().await?;
                Arc::new(store)
            }
        };
        let email_buckets: Arc<dyn EmailBucketStore> = match self.email_buckets {
            Some(buckets) => buckets,
            None => {
                let store = PgEmailBucketStore::new(
                    pool.expect("pool exists when email buckets are defaulted"),
                );
                store.migrate().await?;
                Arc::new(store)
            }
        };

        let bus = PipelineBus::default();
        let queue = QueueStore::new(kv.clone());
        let aggregates = AggregateStore::new(
            kv.clone(),
            clock.clone(),
            Duration::from_secs(config.pipeline.aggregate_idle_expiry_secs),
            Duration::from_secs(config.pipeline.aggregate_max_expiry_secs),
        );

        let router = Router::new(
            registry.clone(),
            queue.clone(),
            tenants.clone(),
            bus.clone(),
            config.pipeline.bucket_count,
        );
        let aggregator = Arc::new(Aggregator::new(
            registry.clone(),
            queue.clone(),
            aggregates.clone(),
            feeds.clone(),
            bus.clone(),
            clock.clone(),
            config.pipeline.collection_batch_size,
        ));
        let notifications = NotificationManager::new(
            kv.clone(),
            aggregates.clone(),
            feeds.clone(),
            principals.clone(),
            clock.clone(),
        );
        let email = Arc::new(EmailScheduler::new(
            registry.clone(),
            kv.clone(),
            email_buckets.clone(),
            feeds.clone(),
            aggregates.clone(),
            mailer.clone(),
            tenants.clone(),
            principals.clone(),
            clock.clone(),
            config.email.clone(),
            config.pipeline.bucket_count,
        ));

        let push_channels = Arc::new(PushChannels::new(pubsub.clone(), registry.clone()));
        let push = Arc::new(PushService::new(
            registry.clone(),
            tenants.clone(),
            clock.clone(),
            push_channels,
            config.push.clone(),
        ));
        let push_publisher = Arc::new(PushPublisher::new(registry.clone(), pubsub.clone()));

        let (seed_tx, seed_rx) = mpsc::channel(config.pipeline.router_queue_capacity);

        Ok(ActivityState {
            inner: Arc::new(StateInner {
                config,
                registry,
                clock,
                kv,
                feeds,
                email_buckets,
                pubsub,
                mailer,
                tenants,
                principals,
                bus,
                queue,
                aggregates,
                router,
                aggregator,
                notifications,
                email,
                push,
                push_publisher,
                seed_tx,
                seed_rx: Mutex::new(Some(seed_rx)),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKeyValue;
    use crate::model::SeedResource;
    use crate::pubsub::MemoryPubSub;
    use crate::stores::{MemoryEmailBucketStore, MemoryFeedStore};

    async fn memory_state() -> ActivityState {
        let clock = ManualClock::new(1_000);
        ActivityState::builder()
            .config(Config::default())
            .registry(Registry::builder().build())
            .clock(clock.clone())
            .key_value(Arc::new(MemoryKeyValue::new(clock.clone())))
            .feed_store(Arc::new(MemoryFeedStore::new(
                clock.clone(),
                Duration::from_secs(1_209_600),
            )))
            .email_bucket_store(Arc::new(MemoryEmailBucketStore::new()))
            .pubsub(Arc::new(MemoryPubSub::new()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_with_memory_stores() {
        let state = memory_state().await;
        assert!(state.take_seed_receiver().is_some());
        // The receiver can only be taken once
        assert!(state.take_seed_receiver().is_none());
    }

    #[tokio::test]
    async fn test_post_activity_validates_synchronously() {
        let state = memory_state().await;

        let malformed = ActivitySeed {
            activity_type: String::new(),
            verb: "share".to_string(),
            published_millis: 1_000,
            actor_resource: SeedResource::new("user", "u:cam:alice"),
            object_resource: None,
            target_resource: None,
        };
        assert!(matches!(
            state.post_activity(malformed).await,
            Err(Error::InvalidInput(_))
        ));

        let unregistered = ActivitySeed {
            activity_type: "not-registered".to_string(),
            verb: "share".to_string(),
            published_millis: 1_000,
            actor_resource: SeedResource::new("user", "u:cam:alice"),
            object_resource: None,
            target_resource: None,
        };
        assert!(matches!(
            state.post_activity(unregistered).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_is_required() {
        let result = ActivityState::builder().config(Config::default()).build().await;
        assert!(result.is_err());
    }
}
