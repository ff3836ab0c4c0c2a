//! Broadcast event bus and the sink seam.
//!
//! Uses [`tokio::sync::broadcast`] for fan-out delivery to multiple
//! subscribers. If no subscriber is listening, events are silently dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::event::RunEvent;

/// Destination for event publication.
///
/// The engine gathers events under its lock and the caller publishes them
/// afterwards, so sink implementations may await freely.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event. Errors are the sink's to report; callers treat
    /// publication as fire-and-forget.
    async fn publish(&self, event: RunEvent) -> Result<(), PublishError>;
}

/// Publication failure surfaced by a sink.
#[derive(Debug, thiserror::Error)]
#[error("event publication failed: {0}")]
pub struct PublishError(pub String);

/// Publish a batch of events, logging and swallowing failures.
pub async fn publish_all(sink: &dyn EventSink, events: Vec<RunEvent>) {
    for event in events {
        let kind = event.kind();
        let run_id = event.scope.run_id.clone();
        if let Err(error) = sink.publish(event).await {
            tracing::warn!(kind, ?run_id, %error, "dropping event publication");
        }
    }
}

/// Broadcast-based event bus.
///
/// # Examples
///
/// ```
/// use lattice_events::{EventBus, EventData, EventScope, RunEvent};
///
/// let bus = EventBus::new(64);
/// let mut sub = bus.subscribe();
/// bus.emit(RunEvent::now(
///     EventScope { tenant: "t".into(), run_id: None, client_session_id: None },
///     EventData::RunSnapshot { run: serde_json::json!({}), nodes: None },
/// ));
/// assert_eq!(bus.total_emitted(), 1);
/// ```
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    emitted: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given channel capacity. When the channel is
    /// full the oldest events are dropped and lagging subscribers observe
    /// `RecvError::Lagged`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    /// Emit one event to all subscribers.
    pub fn emit(&self, event: RunEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Number of currently attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events emitted since creation.
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// [`EventSink`] implementation backed by an [`EventBus`].
pub struct BroadcastSink {
    bus: Arc<EventBus>,
}

impl BroadcastSink {
    /// Wrap a bus as a sink.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: RunEvent) -> Result<(), PublishError> {
        self.bus.emit(event);
        Ok(())
    }
}
