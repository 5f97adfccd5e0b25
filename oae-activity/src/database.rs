//! Postgres connection pool management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::{config::DatabaseConfig, error::Result};

/// Create a Postgres connection pool. Transient startup failures are retried
/// with a doubling delay; the last error is returned once the retries are
/// spent.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut wait = Duration::from_secs(config.retry_delay_secs);
    let mut attempt = 0_u32;

    loop {
        let connected = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await;

        attempt += 1;
        match connected {
            Ok(pool) => {
                tracing::info!(
                    max_connections = config.max_connections,
                    min_connections = config.min_connections,
                    "Postgres pool online"
                );
                return Ok(pool);
            }
            Err(e) if attempt <= config.max_retries => {
                tracing::warn!(
                    attempt,
                    error = %e,
                    next_try_in = ?wait,
                    "Postgres not reachable yet, backing off"
                );
                tokio::time::sleep(wait).await;
                wait += wait;
            }
            Err(e) => {
                tracing::error!(attempt, error = %e, "Postgres connection failed on final retry");
                return Err(e.into());
            }
        }
    }
}
