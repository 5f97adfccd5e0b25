//! Pipeline worker lifecycle
//!
//! [`ActivityService::start`] spawns the long-running workers: the router
//! ingest loop, the aggregation poller, the email scheduler (bucket queueing
//! and collection cycles), notification bookkeeping and the push publisher.
//! Shutdown cancels the root token so no new drains start, then waits a
//! bounded time for in-flight work; anything still holding a bucket lock is
//! covered by the lock TTL.

use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    bucket::BucketCollector,
    state::ActivityState,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to the running pipeline workers
pub struct ActivityService {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ActivityService {
    /// Spawn the pipeline workers
    #[must_use]
    pub fn start(state: ActivityState) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        handles.push(spawn_router_ingest(state.clone(), cancel.clone()));
        handles.push(spawn_aggregation_poller(state.clone(), cancel.clone()));
        handles.push(spawn_email_queueing(state.clone(), cancel.clone()));
        handles.push(spawn_email_poller(state.clone(), cancel.clone()));
        handles.push(spawn_notification_counter(state.clone(), cancel.clone()));
        handles.push(spawn_push_publisher(state, cancel.clone()));

        tracing::info!("Activity pipeline workers started");
        Self { cancel, handles }
    }

    /// Stop the workers: cancel, then wait out the grace period
    pub async fn shutdown(self) {
        tracing::info!("Stopping activity pipeline workers...");
        self.cancel.cancel();
        for handle in self.handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Pipeline worker panicked during shutdown"),
                Err(_) => tracing::warn!("Pipeline worker did not stop within the grace period"),
            }
        }
        tracing::info!("Activity pipeline workers stopped");
    }
}

/// One task per posted seed; routing of distinct seeds is independent
fn spawn_router_ingest(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut seeds) = state.take_seed_receiver() else {
            tracing::error!("Router ingest receiver was already taken");
            return;
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                seed = seeds.recv() => {
                    let Some(seed) = seed else { break };
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = state.router().route(seed).await {
                            tracing::warn!(error = %e, "Seed routing failed");
                        }
                    });
                }
            }
        }
        tracing::debug!("Router ingest stopped");
    })
}

fn spawn_aggregation_poller(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pipeline = &state.config().pipeline;
        let collector = BucketCollector::new(
            state.kv().clone(),
            "oae-activity:collection",
            pipeline.bucket_count,
            pipeline.max_concurrent_collections,
            Duration::from_secs(pipeline.collection_lock_ttl_secs),
        );
        let aggregator = state.aggregator();
        let mut ticker = tokio::time::interval(pipeline.collection_polling_frequency());

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    collector.collect_all(aggregator.clone()).await;
                }
            }
        }
        tracing::debug!("Aggregation poller stopped");
    })
}

fn spawn_email_queueing(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    // Subscribe before spawning so no early delivery slips past
    let mut delivered = state.bus().subscribe_delivered();
    tokio::spawn(async move {
        let scheduler = state.email_scheduler();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = delivered.recv() => match event {
                    Ok(event) => scheduler.on_delivered(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Email queueing lagged behind deliveries");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Email queueing stopped");
    })
}

fn spawn_email_poller(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let scheduler = state.email_scheduler();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            state.config().email.polling_frequency_secs,
        ));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => scheduler.run_cycle().await,
            }
        }
        tracing::debug!("Email poller stopped");
    })
}

fn spawn_notification_counter(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    let mut delivered = state.bus().subscribe_delivered();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = delivered.recv() => match event {
                    Ok(event) => state.notifications().on_delivered(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification counter lagged behind deliveries");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Notification counter stopped");
    })
}

fn spawn_push_publisher(state: ActivityState, cancel: CancellationToken) -> JoinHandle<()> {
    let mut routed = state.bus().subscribe_routed();
    let mut delivered = state.bus().subscribe_delivered();
    tokio::spawn(async move {
        let publisher = state.push_publisher();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = routed.recv() => match event {
                    Ok(event) => publisher.on_routed(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Push publisher lagged behind routing");
                    }
                    Err(RecvError::Closed) => break,
                },
                event = delivered.recv() => match event {
                    Ok(event) => publisher.on_delivered(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Push publisher lagged behind deliveries");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Push publisher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::kv::MemoryKeyValue;
    use crate::pubsub::MemoryPubSub;
    use crate::registry::Registry;
    use crate::stores::{MemoryEmailBucketStore, MemoryFeedStore};
    use std::sync::Arc;

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

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let state = memory_state().await;
        let service = ActivityService::start(state);
        // Let the workers reach their first poll
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_prompt_even_with_idle_pollers() {
        let state = memory_state().await;
        let service = ActivityService::start(state);
        tokio::time::sleep(Duration::from_secs(60)).await;
        service.shutdown().await;
    }
}
