//! Bridges the internal bus onto pub/sub push channels
//!
//! Streams whose push phase is ROUTING are published as soon as the router
//! queues them, one activity per message. AGGREGATION-phase streams are
//! published when a collection delivers them, with the aggregated activities
//! and the count of newly created ones.

use std::sync::Arc;

use crate::{
    bus::{DeliveredActivitiesEvent, RoutedActivitiesEvent},
    pubsub::PubSub,
    push::frames::{push_channel, PushEnvelope},
    registry::{PushPhase, Registry},
};

/// Publishes pipeline events onto per-stream pub/sub channels
pub struct PushPublisher {
    registry: Arc<Registry>,
    pubsub: Arc<dyn PubSub>,
}

impl PushPublisher {
    /// Create a publisher
    #[must_use]
    pub fn new(registry: Arc<Registry>, pubsub: Arc<dyn PubSub>) -> Self {
        Self { registry, pubsub }
    }

    /// Push ROUTING-phase streams, one activity per message
    pub async fn on_routed(&self, event: &RoutedActivitiesEvent) {
        for routed in event.routed.iter() {
            let Some(options) = self.registry.stream_type(&routed.route.stream_type) else {
                continue;
            };
            if options.push_phase != PushPhase::Routing {
                continue;
            }

            let envelope = PushEnvelope {
                resource_id: routed.route.resource_id.clone(),
                stream_type: routed.route.stream_type.clone(),
                activities: vec![routed.activity.clone()],
                num_new_activities: None,
            };
            self.publish(&envelope).await;
        }
    }

    /// Push AGGREGATION-phase streams with their delivery counts
    pub async fn on_delivered(&self, event: &DeliveredActivitiesEvent) {
        for (recipient, streams) in event.deliveries.iter() {
            for (stream_type, delivery) in streams {
                let Some(options) = self.registry.stream_type(stream_type) else {
                    continue;
                };
                if options.push_phase != PushPhase::Aggregation {
                    continue;
                }

                let envelope = PushEnvelope {
                    resource_id: recipient.clone(),
                    stream_type: stream_type.clone(),
                    activities: delivery.activities.clone(),
                    num_new_activities: Some(delivery.num_new_activities),
                };
                self.publish(&envelope).await;
            }
        }
    }

    async fn publish(&self, envelope: &PushEnvelope) {
        let channel = push_channel(&envelope.resource_id, &envelope.stream_type);
        let payload = match serde_json::to_vec(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to serialize push envelope");
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(&channel, payload).await {
            tracing::warn!(channel = %channel, error = %e, "Push publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiContext;
    use crate::bus::StreamDelivery;
    use crate::error::Result;
    use crate::model::{Activity, ActivityEntity, Route, RoutedActivity};
    use crate::pubsub::MemoryPubSub;
    use crate::registry::{StreamAuthorizer, StreamTypeOptions};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct AllowAll;

    #[async_trait]
    impl StreamAuthorizer for AllowAll {
        async fn authorize(
            &self,
            _ctx: &ApiContext,
            _resource_id: &str,
            _token: Option<&serde_json::Value>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn stream(push_phase: PushPhase) -> StreamTypeOptions {
        StreamTypeOptions {
            transient: false,
            visibility_bucketing: false,
            push_phase,
            authorizer: Arc::new(AllowAll),
        }
    }

    fn activity() -> Activity {
        Activity {
            activity_type: "message-post".to_string(),
            activity_id: "1000:aaaaaaaa".to_string(),
            verb: "post".to_string(),
            published_millis: 1_000,
            actor: ActivityEntity::new("user", "u:cam:alice"),
            object: None,
            target: None,
        }
    }

    #[tokio::test]
    async fn test_routing_phase_streams_push_on_routed() {
        let registry = Arc::new(
            Registry::builder()
                .stream_type("message", stream(PushPhase::Routing))
                .unwrap()
                .build(),
        );
        let pubsub = Arc::new(MemoryPubSub::new());
        let mut sub = pubsub.subscribe("c:cam:doc#message").await.unwrap();

        let publisher = PushPublisher::new(registry, pubsub);
        publisher
            .on_routed(&RoutedActivitiesEvent {
                routed: Arc::new(vec![RoutedActivity {
                    route: Route::new("c:cam:doc", "message", true),
                    activity: activity(),
                }]),
            })
            .await;

        let payload = sub.recv().await.unwrap();
        let envelope: PushEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.activities.len(), 1);
        assert_eq!(envelope.num_new_activities, None);
    }

    #[tokio::test]
    async fn test_aggregation_phase_streams_push_on_delivered() {
        let registry = Arc::new(
            Registry::builder()
                .stream_type("activity", stream(PushPhase::Aggregation))
                .unwrap()
                .build(),
        );
        let pubsub = Arc::new(MemoryPubSub::new());
        let mut sub = pubsub.subscribe("u:cam:alice#activity").await.unwrap();

        let mut streams = HashMap::new();
        streams.insert(
            "activity".to_string(),
            StreamDelivery {
                activities: vec![activity()],
                num_new_activities: 1,
            },
        );
        let mut deliveries = HashMap::new();
        deliveries.insert("u:cam:alice".to_string(), streams);

        let publisher = PushPublisher::new(registry, pubsub);
        publisher
            .on_delivered(&DeliveredActivitiesEvent {
                deliveries: Arc::new(deliveries),
            })
            .await;

        let payload = sub.recv().await.unwrap();
        let envelope: PushEnvelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.num_new_activities, Some(1));
        assert_eq!(envelope.stream_type, "activity");
    }

    #[tokio::test]
    async fn test_phase_mismatch_is_not_pushed() {
        let registry = Arc::new(
            Registry::builder()
                .stream_type("activity", stream(PushPhase::Aggregation))
                .unwrap()
                .build(),
        );
        let pubsub = Arc::new(MemoryPubSub::new());
        let mut sub = pubsub.subscribe("u:cam:alice#activity").await.unwrap();

        let publisher = PushPublisher::new(registry, pubsub.clone());
        // Routed event for an aggregation-phase stream: nothing on the bus
        publisher
            .on_routed(&RoutedActivitiesEvent {
                routed: Arc::new(vec![RoutedActivity {
                    route: Route::new("u:cam:alice", "activity", false),
                    activity: activity(),
                }]),
            })
            .await;

        // Publish a sentinel to prove ordering
        pubsub
            .publish("u:cam:alice#activity", b"sentinel".to_vec())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), b"sentinel");
    }
}
