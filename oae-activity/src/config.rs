//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: OAE_)
//! 2. Current working directory: ./config.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Key-value store (Redis) configuration
    pub redis: RedisConfig,

    /// Row store (Postgres) configuration
    pub database: DatabaseConfig,

    /// Pub/sub (NATS) configuration
    pub nats: NatsConfig,

    /// Routing/aggregation pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Email digest scheduling
    #[serde(default)]
    pub email: EmailConfig,

    /// Push service tuning
    #[serde(default)]
    pub push: PushConfig,

    /// Tenants known to this deployment
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Timeout for pool checkouts and new connections, in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Row store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Connection name
    #[serde(default)]
    pub name: Option<String>,

    /// Max reconnection attempts
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,

    /// Maximum retry attempts for initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Routing and aggregation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of buckets routed activities are partitioned into
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,

    /// Maximum routed activities peeked per bucket drain
    #[serde(default = "default_collection_batch_size")]
    pub collection_batch_size: usize,

    /// Maximum buckets drained concurrently by one process
    #[serde(default = "default_max_concurrent_collections")]
    pub max_concurrent_collections: usize,

    /// Seconds between collection cycles. Must be at least the lock TTL so
    /// the previous holder's next cycle sees a drained bucket rather than
    /// seizing it back.
    #[serde(default = "default_collection_polling_frequency")]
    pub collection_polling_frequency_secs: u64,

    /// TTL of the per-bucket collection lock in seconds. Must cover the
    /// expected drain time of one batch.
    #[serde(default = "default_collection_lock_ttl")]
    pub collection_lock_ttl_secs: u64,

    /// Idle expiry of an aggregate: refreshed on every touch
    #[serde(default = "default_aggregate_idle_expiry")]
    pub aggregate_idle_expiry_secs: u64,

    /// Hard upper bound on an aggregate's lifetime regardless of touches
    #[serde(default = "default_aggregate_max_expiry")]
    pub aggregate_max_expiry_secs: u64,

    /// TTL of persisted feed entries
    #[serde(default = "default_activity_ttl")]
    pub activity_ttl_secs: u64,

    /// Capacity of the router ingest channel
    #[serde(default = "default_router_queue_capacity")]
    pub router_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
            collection_batch_size: default_collection_batch_size(),
            max_concurrent_collections: default_max_concurrent_collections(),
            collection_polling_frequency_secs: default_collection_polling_frequency(),
            collection_lock_ttl_secs: default_collection_lock_ttl(),
            aggregate_idle_expiry_secs: default_aggregate_idle_expiry(),
            aggregate_max_expiry_secs: default_aggregate_max_expiry(),
            activity_ttl_secs: default_activity_ttl(),
            router_queue_capacity: default_router_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Idle expiry as milliseconds
    #[must_use]
    pub fn aggregate_idle_expiry_millis(&self) -> i64 {
        self.aggregate_idle_expiry_secs as i64 * 1_000
    }

    /// Max expiry as milliseconds
    #[must_use]
    pub fn aggregate_max_expiry_millis(&self) -> i64 {
        self.aggregate_max_expiry_secs as i64 * 1_000
    }

    /// Collection polling frequency as a Duration
    #[must_use]
    pub fn collection_polling_frequency(&self) -> Duration {
        Duration::from_secs(self.collection_polling_frequency_secs)
    }
}

/// Email digest scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Seconds between email collection cycles
    #[serde(default = "default_email_polling_frequency")]
    pub polling_frequency_secs: u64,

    /// Activities newer than this suppress a user's digest until the next cycle
    #[serde(default = "default_email_grace_period")]
    pub grace_period_secs: u64,

    /// TTL of the per-email-bucket collection lock in seconds
    #[serde(default = "default_collection_lock_ttl")]
    pub collection_lock_ttl_secs: u64,

    /// Users paged per bucket collection
    #[serde(default = "default_email_batch_size")]
    pub batch_size: usize,

    /// Local hour of day mail is delivered when a tenant does not configure one
    #[serde(default = "default_mail_hour")]
    pub default_mail_hour: u32,

    /// Local day of week (0 = Sunday) weekly mail is delivered when a tenant
    /// does not configure one
    #[serde(default = "default_mail_day")]
    pub default_mail_day: u32,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            polling_frequency_secs: default_email_polling_frequency(),
            grace_period_secs: default_email_grace_period(),
            collection_lock_ttl_secs: default_collection_lock_ttl(),
            batch_size: default_email_batch_size(),
            default_mail_hour: default_mail_hour(),
            default_mail_day: default_mail_day(),
        }
    }
}

impl EmailConfig {
    /// Grace period as milliseconds
    #[must_use]
    pub fn grace_period_millis(&self) -> i64 {
        self.grace_period_secs as i64 * 1_000
    }
}

/// Push service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Seconds a new socket may stay unauthenticated before it is closed
    #[serde(default = "default_authentication_timeout")]
    pub authentication_timeout_secs: u64,

    /// Capacity of each socket's outbound message channel
    #[serde(default = "default_push_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            authentication_timeout_secs: default_authentication_timeout(),
            channel_capacity: default_push_channel_capacity(),
        }
    }
}

/// One tenant known to this deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant alias, the middle segment of resource ids
    pub alias: String,

    /// Display name
    pub display_name: String,

    /// Base URL used in rendered links
    pub base_url: String,

    /// Email domains owned by this tenant
    #[serde(default)]
    pub email_domains: Vec<String>,

    /// Offset of the tenant's timezone from UTC, in hours
    #[serde(default)]
    pub timezone_offset_hours: i32,

    /// Local hour of day digests are delivered
    #[serde(default = "default_mail_hour")]
    pub mail_hour: u32,

    /// Local day of week (0 = Sunday) weekly digests are delivered
    #[serde(default = "default_mail_day")]
    pub mail_day: u32,

    /// Key for expiring resource signatures issued to this tenant's users
    #[serde(default = "default_signing_key")]
    pub signing_key: String,

    /// Private tenants do not interact with other tenants
    #[serde(default)]
    pub private: bool,
}

impl Config {
    /// Load configuration from defaults, `./config.toml` and `OAE_`-prefixed
    /// environment variables
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("OAE_").split("__"))
            .extract()?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "oae-activityd".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                max_connections: default_redis_max_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost:5432/oae".to_string(),
                max_connections: default_db_max_connections(),
                min_connections: default_db_min_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                name: None,
                max_reconnects: default_max_reconnects(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            pipeline: PipelineConfig::default(),
            email: EmailConfig::default(),
            push: PushConfig::default(),
            tenants: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_redis_max_connections() -> usize {
    16
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_reconnects() -> usize {
    10
}

fn default_bucket_count() -> u32 {
    8
}

fn default_collection_batch_size() -> usize {
    500
}

fn default_max_concurrent_collections() -> usize {
    3
}

fn default_collection_polling_frequency() -> u64 {
    15
}

fn default_collection_lock_ttl() -> u64 {
    15
}

fn default_aggregate_idle_expiry() -> u64 {
    3_600
}

fn default_aggregate_max_expiry() -> u64 {
    86_400
}

fn default_activity_ttl() -> u64 {
    1_209_600
}

fn default_router_queue_capacity() -> usize {
    1_024
}

fn default_email_polling_frequency() -> u64 {
    60
}

fn default_email_grace_period() -> u64 {
    300
}

fn default_email_batch_size() -> usize {
    250
}

fn default_mail_hour() -> u32 {
    8
}

fn default_mail_day() -> u32 {
    1
}

fn default_authentication_timeout() -> u64 {
    5
}

fn default_push_channel_capacity() -> usize {
    64
}

fn default_signing_key() -> String {
    "insecure-dev-signing-key".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_coherent() {
        let config = Config::default();
        assert_eq!(config.service.name, "oae-activityd");
        assert!(config.pipeline.bucket_count > 0);
        // The polling frequency must cover the lock TTL so a previous lock
        // holder's next cycle observes a drained bucket.
        assert!(
            config.pipeline.collection_polling_frequency_secs
                >= config.pipeline.collection_lock_ttl_secs
        );
    }

    #[test]
    fn test_expiry_conversions() {
        let pipeline = PipelineConfig::default();
        assert_eq!(
            pipeline.aggregate_idle_expiry_millis(),
            pipeline.aggregate_idle_expiry_secs as i64 * 1_000
        );
        assert!(pipeline.aggregate_max_expiry_millis() > pipeline.aggregate_idle_expiry_millis());
    }

    #[test]
    fn test_email_defaults() {
        let email = EmailConfig::default();
        assert_eq!(email.grace_period_millis(), 300_000);
        assert!(email.default_mail_hour < 24);
        assert!(email.default_mail_day < 7);
    }
}
