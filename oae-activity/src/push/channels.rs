//! Per-channel fan-out to local WebSocket subscribers
//!
//! One process holds at most one bus subscription per channel, regardless of
//! how many sockets subscribe to it. Incoming envelopes are transformed once
//! per requested format and cloned per subscriber. Handlers serialise per
//! channel and run in parallel across channels.

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::Result,
    model::ActivityFormat,
    pubsub::PubSub,
    push::frames::PushEnvelope,
    registry::Registry,
    transform::transform_activities,
};

#[derive(Clone)]
struct Subscriber {
    formats: Vec<ActivityFormat>,
    tx: mpsc::Sender<Message>,
}

struct Channel {
    cancel: CancellationToken,
    subscribers: Arc<DashMap<Uuid, Subscriber>>,
}

/// The process-level channel table
pub struct PushChannels {
    pubsub: Arc<dyn PubSub>,
    registry: Arc<Registry>,
    channels: DashMap<String, Channel>,
}

impl PushChannels {
    /// Create an empty channel table
    #[must_use]
    pub fn new(pubsub: Arc<dyn PubSub>, registry: Arc<Registry>) -> Self {
        Self {
            pubsub,
            registry,
            channels: DashMap::new(),
        }
    }

    /// Add a socket's subscription to a channel in one format. The first
    /// subscriber of a channel opens the bus subscription.
    pub async fn subscribe(
        &self,
        channel_name: &str,
        connection_id: Uuid,
        format: ActivityFormat,
        tx: mpsc::Sender<Message>,
    ) -> Result<()> {
        if let Some(channel) = self.channels.get(channel_name) {
            channel
                .subscribers
                .entry(connection_id)
                .and_modify(|subscriber| {
                    if !subscriber.formats.contains(&format) {
                        subscriber.formats.push(format);
                    }
                })
                .or_insert_with(|| Subscriber {
                    formats: vec![format],
                    tx: tx.clone(),
                });
            return Ok(());
        }

        let mut subscription = self.pubsub.subscribe(channel_name).await?;
        let cancel = CancellationToken::new();
        let subscribers: Arc<DashMap<Uuid, Subscriber>> = Arc::new(DashMap::new());
        subscribers.insert(
            connection_id,
            Subscriber {
                formats: vec![format],
                tx,
            },
        );

        let task_cancel = cancel.clone();
        let task_subscribers = subscribers.clone();
        let task_registry = self.registry.clone();
        let task_channel = channel_name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    payload = subscription.recv() => {
                        let Some(payload) = payload else { break };
                        dispatch(&task_registry, &task_channel, &payload, &task_subscribers).await;
                    }
                }
            }
            tracing::debug!(channel = %task_channel, "Channel handler stopped");
        });

        self.channels.insert(
            channel_name.to_string(),
            Channel {
                cancel,
                subscribers,
            },
        );
        tracing::debug!(channel = channel_name, "Bus subscription opened");
        Ok(())
    }

    /// Remove every subscription of a closing socket; channels left without
    /// local subscribers are unsubscribed from the bus
    pub fn remove_connection(&self, connection_id: Uuid) {
        let mut emptied: Vec<String> = Vec::new();
        for entry in self.channels.iter() {
            entry.value().subscribers.remove(&connection_id);
            if entry.value().subscribers.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for channel_name in emptied {
            if let Some((_, channel)) = self
                .channels
                .remove_if(&channel_name, |_, c| c.subscribers.is_empty())
            {
                channel.cancel.cancel();
                tracing::debug!(channel = %channel_name, "Bus subscription closed");
            }
        }
    }

    /// Number of channels with live bus subscriptions
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Deliver one bus payload to every local subscriber of a channel
async fn dispatch(
    registry: &Registry,
    channel: &str,
    payload: &[u8],
    subscribers: &DashMap<Uuid, Subscriber>,
) {
    let envelope: PushEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(channel, error = %e, "Dropping unparseable push envelope");
            return;
        }
    };

    // Transform once per requested format, clone per subscriber
    let mut rendered: HashMap<ActivityFormat, String> = HashMap::new();
    let formats: Vec<ActivityFormat> = {
        let mut formats: Vec<ActivityFormat> = Vec::new();
        for subscriber in subscribers.iter() {
            for format in &subscriber.formats {
                if !formats.contains(format) {
                    formats.push(*format);
                }
            }
        }
        formats
    };

    for format in formats {
        let activities =
            transform_activities(registry, format, &envelope.activities).await;
        let frame = serde_json::json!({
            "resourceId": envelope.resource_id,
            "streamType": envelope.stream_type,
            "format": format.as_str(),
            "activities": activities,
            "numNewActivities": envelope.num_new_activities,
        });
        match serde_json::to_string(&frame) {
            Ok(text) => {
                rendered.insert(format, text);
            }
            Err(e) => {
                tracing::warn!(channel, error = %e, "Failed to serialize push frame");
            }
        }
    }

    for subscriber in subscribers.iter() {
        for format in &subscriber.formats {
            if let Some(text) = rendered.get(format) {
                // A full or closed socket misses this frame; the writer task
                // handles the actual disconnect
                let _ = subscriber.tx.try_send(Message::Text(text.clone().into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, ActivityEntity};
    use crate::pubsub::MemoryPubSub;
    use crate::push::frames::push_channel;

    fn channels() -> (Arc<MemoryPubSub>, PushChannels) {
        let pubsub = Arc::new(MemoryPubSub::new());
        let registry = Arc::new(Registry::builder().build());
        let channels = PushChannels::new(pubsub.clone(), registry);
        (pubsub, channels)
    }

    fn envelope() -> Vec<u8> {
        serde_json::to_vec(&PushEnvelope {
            resource_id: "u:cam:alice".to_string(),
            stream_type: "activity".to_string(),
            activities: vec![Activity {
                activity_type: "content-create".to_string(),
                activity_id: "1000:aaaaaaaa".to_string(),
                verb: "create".to_string(),
                published_millis: 1_000,
                actor: ActivityEntity::new("user", "u:cam:alice"),
                object: None,
                target: None,
            }],
            num_new_activities: Some(1),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_subscriber_receives_formatted_frame() {
        let (pubsub, channels) = channels();
        let channel = push_channel("u:cam:alice", "activity");
        let (tx, mut rx) = mpsc::channel(8);

        channels
            .subscribe(&channel, Uuid::new_v4(), ActivityFormat::Internal, tx)
            .await
            .unwrap();
        pubsub.publish(&channel, envelope()).await.unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Text(text) = message else {
            panic!("expected a text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["streamType"], "activity");
        assert_eq!(frame["numNewActivities"], 1);
        assert_eq!(frame["activities"][0]["activityId"], "1000:aaaaaaaa");
    }

    #[tokio::test]
    async fn test_one_bus_subscription_per_channel() {
        let (_, channels) = channels();
        let channel = push_channel("u:cam:alice", "activity");
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        channels
            .subscribe(&channel, Uuid::new_v4(), ActivityFormat::Internal, tx1)
            .await
            .unwrap();
        channels
            .subscribe(&channel, Uuid::new_v4(), ActivityFormat::ActivityStreams, tx2)
            .await
            .unwrap();

        assert_eq!(channels.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_last_subscriber_leaving_closes_channel() {
        let (_, channels) = channels();
        let channel = push_channel("u:cam:alice", "activity");
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);

        channels
            .subscribe(&channel, conn_a, ActivityFormat::Internal, tx.clone())
            .await
            .unwrap();
        channels
            .subscribe(&channel, conn_b, ActivityFormat::Internal, tx)
            .await
            .unwrap();

        channels.remove_connection(conn_a);
        assert_eq!(channels.channel_count(), 1);

        channels.remove_connection(conn_b);
        assert_eq!(channels.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_same_stream_in_two_formats_on_one_socket() {
        let (pubsub, channels) = channels();
        let channel = push_channel("u:cam:alice", "activity");
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);

        channels
            .subscribe(&channel, conn, ActivityFormat::Internal, tx.clone())
            .await
            .unwrap();
        channels
            .subscribe(&channel, conn, ActivityFormat::ActivityStreams, tx)
            .await
            .unwrap();

        pubsub.publish(&channel, envelope()).await.unwrap();

        let mut formats = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let Message::Text(text) = message else {
                panic!("expected a text frame");
            };
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            formats.push(frame["format"].as_str().unwrap().to_string());
        }
        formats.sort_unstable();
        assert_eq!(formats, vec!["activitystreams", "internal"]);
    }
}
