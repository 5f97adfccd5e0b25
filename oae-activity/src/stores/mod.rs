//! Persistence of the pipeline: queued routed activities, aggregate state,
//! feeds and email buckets

pub mod aggregate;
pub mod email_bucket;
pub mod feed;
pub mod queue;

pub use aggregate::{AggregateStore, RoleEntityMaps};
pub use email_bucket::{EmailBucketStore, MemoryEmailBucketStore, PgEmailBucketStore};
pub use feed::{FeedPage, FeedStore, MemoryFeedStore, PgFeedStore};
pub use queue::QueueStore;
