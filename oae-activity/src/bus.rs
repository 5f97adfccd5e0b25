//! Internal typed event bus
//!
//! The router and aggregator publish their stage results here; the
//! notifications module, email scheduler and push service each hold a named
//! subscription. The bus is owned by the pipeline state rather than being a
//! process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::model::{Activity, RoutedActivity};

/// Activities the router just queued, one entry per surviving route
#[derive(Debug, Clone)]
pub struct RoutedActivitiesEvent {
    /// The routed activities of one seed
    pub routed: Arc<Vec<RoutedActivity>>,
}

/// What one feed received from a collection
#[derive(Debug, Clone)]
pub struct StreamDelivery {
    /// The aggregated activities delivered to the feed
    pub activities: Vec<Activity>,

    /// How many of them were newly created rather than updated in place
    pub num_new_activities: usize,
}

/// Everything a collection delivered, per recipient per stream type
#[derive(Debug, Clone)]
pub struct DeliveredActivitiesEvent {
    /// recipient resource id → stream type → delivery
    pub deliveries: Arc<HashMap<String, HashMap<String, StreamDelivery>>>,
}

/// The pipeline's internal channels
#[derive(Debug, Clone)]
pub struct PipelineBus {
    routed_tx: broadcast::Sender<RoutedActivitiesEvent>,
    delivered_tx: broadcast::Sender<DeliveredActivitiesEvent>,
}

impl PipelineBus {
    /// Create a bus whose subscribers may lag by at most `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (routed_tx, _) = broadcast::channel(capacity);
        let (delivered_tx, _) = broadcast::channel(capacity);
        Self {
            routed_tx,
            delivered_tx,
        }
    }

    /// Publish a routed-activities event; subscribers that lag drop events
    pub fn publish_routed(&self, event: RoutedActivitiesEvent) {
        // Err means no live subscribers, which is fine during startup/shutdown
        let _ = self.routed_tx.send(event);
    }

    /// Publish a delivered-activities event
    pub fn publish_delivered(&self, event: DeliveredActivitiesEvent) {
        let _ = self.delivered_tx.send(event);
    }

    /// Subscribe to routed-activities events
    #[must_use]
    pub fn subscribe_routed(&self) -> broadcast::Receiver<RoutedActivitiesEvent> {
        self.routed_tx.subscribe()
    }

    /// Subscribe to delivered-activities events
    #[must_use]
    pub fn subscribe_delivered(&self) -> broadcast::Receiver<DeliveredActivitiesEvent> {
        self.delivered_tx.subscribe()
    }
}

impl Default for PipelineBus {
    fn default() -> Self {
        Self::new(256)
    }
}
