//! Pub/sub bus interface
//!
//! Live push fan-out crosses process boundaries over a pub/sub bus with one
//! channel per (resource, stream type) pair. [`NatsPubSub`] is the production
//! implementation; [`MemoryPubSub`] keeps everything in-process for tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    config::NatsConfig,
    error::{Error, Result},
};

/// A per-process subscription to one channel. Dropping the subscription
/// releases the underlying bus resources.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Receive the next message, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Publish/subscribe over named channels
#[async_trait]
pub trait PubSub: Send + Sync + fmt::Debug {
    /// Publish a payload to a channel
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a channel. Each call creates an independent subscription;
    /// callers that need process-level idempotence hold one subscription per
    /// channel themselves.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

// ============================================================================
// NATS implementation
// ============================================================================

/// Create a NATS client, backing off exponentially between attempts. The
/// final attempt's error is what the caller sees.
pub async fn create_client(config: &NatsConfig) -> Result<async_nats::Client> {
    let base = Duration::from_secs(config.retry_delay_secs);

    for attempt in 0..config.max_retries {
        match try_create_client(config).await {
            Ok(client) => {
                tracing::info!(url = %config.url, "NATS client connected");
                return Ok(client);
            }
            Err(e) => {
                let wait = base * 2_u32.saturating_pow(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    error = %e,
                    wait = ?wait,
                    "NATS connect attempt failed, backing off"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    match try_create_client(config).await {
        Ok(client) => {
            tracing::info!(url = %config.url, "NATS client connected");
            Ok(client)
        }
        Err(e) => {
            tracing::error!(url = %config.url, error = %e, "Could not reach NATS, giving up");
            Err(e)
        }
    }
}

async fn try_create_client(config: &NatsConfig) -> Result<async_nats::Client> {
    let mut opts =
        async_nats::ConnectOptions::new().max_reconnects(Some(config.max_reconnects));
    if let Some(name) = &config.name {
        opts = opts.name(name);
    }

    opts.connect(&config.url)
        .await
        .map_err(|e| Error::Nats(format!("connect to {}: {}", config.url, e)))
}

/// [`PubSub`] over a NATS client
#[derive(Clone)]
pub struct NatsPubSub {
    client: async_nats::Client,
}

impl NatsPubSub {
    /// Wrap an existing client
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Bootstrap a client from configuration and wrap it
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        Ok(Self::new(create_client(config).await?))
    }
}

impl fmt::Debug for NatsPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsPubSub").finish_non_exhaustive()
    }
}

#[async_trait]
impl PubSub for NatsPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(channel.to_string(), payload.into())
            .await
            .map_err(|e| Error::Nats(format!("Failed to publish to {}: {}", channel, e)))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(|e| Error::Nats(format!("Failed to subscribe to {}: {}", channel, e)))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(message.payload.to_vec()).await.is_err() {
                    // Receiver dropped; release the bus subscription
                    let _ = subscriber.unsubscribe().await;
                    break;
                }
            }
        });

        Ok(Subscription { rx })
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-process [`PubSub`] for tests and single-node dev runs
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryPubSub {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let senders: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut channels = self.channels.lock().expect("pubsub poisoned");
            match channels.get_mut(channel) {
                Some(senders) => {
                    senders.retain(|tx| !tx.is_closed());
                    senders.clone()
                }
                None => return Ok(()),
            }
        };

        for tx in senders {
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        self.channels
            .lock()
            .expect("pubsub poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription { rx })
    }
}
