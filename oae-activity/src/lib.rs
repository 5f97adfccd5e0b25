//! # oae-activity
//!
//! The activity pipeline of the platform: turns domain events (a file
//! uploaded, a comment posted, a member added to a group) into aggregated
//! entries in per-recipient activity feeds, notification feeds and email
//! digests, and pushes live updates to connected WebSocket clients.
//!
//! ## Architecture
//!
//! - **Registry**: plug-in tables of activity types, entity types,
//!   associations and stream types, frozen before ingest starts
//! - **Router**: produces entities and routes for a seed, applies
//!   propagation rules, enqueues routed activities into hashed buckets
//! - **Aggregator**: drains buckets under a single-owner lock, merges
//!   activities on their aggregation pivots and delivers them to feeds
//! - **Notifications**: per-user unread counters and last-read tracking
//! - **Email scheduler**: time-zoned immediate/daily/weekly digest buckets
//! - **Push service**: authenticated WebSocket sessions fanned out over
//!   pub/sub channels
//!
//! External collaborators (key-value store, row store, pub/sub bus, mailer,
//! tenant and principal directories, clock) are traits with production and
//! in-memory implementations, so the whole pipeline runs in tests without
//! any server.
//!
//! ## Example
//!
//! ```rust,no_run
//! use oae_activity::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let registry = Registry::builder().build();
//!     let state = ActivityState::builder()
//!         .config(config.clone())
//!         .registry(registry)
//!         .build()
//!         .await?;
//!
//!     let service = ActivityService::start(state.clone());
//!     Server::new(config).serve(api::router(state)).await?;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod api;
pub mod bucket;
pub mod bus;
pub mod clock;
pub mod config;
pub mod database;
pub mod email;
pub mod error;
pub mod kv;
pub mod mailer;
pub mod model;
pub mod notifications;
pub mod observability;
pub mod principal;
pub mod pubsub;
pub mod push;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod signing;
pub mod state;
pub mod stores;
pub mod streams;
pub mod tenant;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::model::{
        Activity, ActivityEntity, ActivitySeed, EmailPreference, Route, RoutedActivity,
        SeedResource, Visibility,
    };
    pub use crate::observability::init_tracing;
    pub use crate::registry::{Registry, RegistryBuilder};
    pub use crate::server::Server;
    pub use crate::service::ActivityService;
    pub use crate::state::{ActivityState, ActivityStateBuilder};

    pub use axum::{
        extract::{Path, Query, State},
        http::StatusCode,
        response::{IntoResponse, Json, Response},
        routing::{delete, get, post},
        Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use thiserror::Error as ThisError;

    // Re-export time utilities
    pub use chrono::{DateTime, Utc};
}
