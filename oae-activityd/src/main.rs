//! Activity pipeline server daemon
//!
//! Loads configuration, registers the built-in stream types, wires the
//! production stores and serves the HTTP/WebSocket API. Domain modules
//! register their activity and entity types against the registry builder
//! before the freeze; this daemon ships with the platform's built-in streams
//! only.

use anyhow::Context;

use oae_activity::{
    api,
    config::Config,
    observability::init_tracing,
    principal::StaticPrincipalService,
    registry::Registry,
    server::Server,
    service::ActivityService,
    state::ActivityState,
    streams::register_builtin_stream_types,
    tenant::StaticTenantService,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config).context("failed to initialise tracing")?;

    let tenants = Arc::new(StaticTenantService::new(config.tenants.clone()));
    let principals = Arc::new(StaticPrincipalService::new());

    let registry = register_builtin_stream_types(
        Registry::builder(),
        principals.clone(),
        tenants.clone(),
    )
    .context("failed to register built-in stream types")?
    .build();

    let state = ActivityState::builder()
        .config(config.clone())
        .registry(registry)
        .tenant_service(tenants)
        .principal_service(principals)
        .build()
        .await
        .context("failed to build pipeline state")?;

    let service = ActivityService::start(state.clone());

    let result = Server::new(config).serve(api::router(state)).await;

    service.shutdown().await;

    result.context("server failed")?;
    tracing::info!("oae-activityd stopped");
    Ok(())
}
