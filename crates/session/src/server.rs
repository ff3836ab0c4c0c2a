//! Control-plane WebSocket server.
//!
//! Accepts worker connections, drives each through a [`ConnectionDriver`],
//! and hands in-order business frames to the registered envelope handler.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use lattice_config::SchedulerConfig;
use lattice_events::EventSink;
use lattice_protocol::Envelope;
use tokio::sync::mpsc;

use crate::connection::{ConnectionDriver, ConnectionShared};
use crate::registry::{WorkerRegistry, WorkerSessionSnapshot};
use crate::tokens::SessionTokens;

/// Receives in-order business frames (and `control.ack` pass-throughs).
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handle one envelope. Failures must be contained: the session loop
    /// keeps running regardless.
    async fn handle(&self, envelope: Envelope, session: Option<WorkerSessionSnapshot>);
}

/// The control-plane server: WebSocket accept plus envelope routing.
pub struct ControlPlaneServer {
    registry: Arc<WorkerRegistry>,
    tokens: Arc<SessionTokens>,
    config: SchedulerConfig,
    sink: Arc<dyn EventSink>,
    handler: Arc<dyn EnvelopeHandler>,
    scheduler_id: String,
}

impl ControlPlaneServer {
    /// Assemble the server.
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        tokens: Arc<SessionTokens>,
        config: SchedulerConfig,
        sink: Arc<dyn EventSink>,
        handler: Arc<dyn EnvelopeHandler>,
        scheduler_id: String,
    ) -> Self {
        Self {
            registry,
            tokens,
            config,
            sink,
            handler,
            scheduler_id,
        }
    }

    /// The scheduler identity stamped on outbound envelopes.
    #[must_use]
    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }

    /// The worker registry backing this server.
    #[must_use]
    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Build the axum router exposing `/ws/worker`.
    #[must_use]
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws/worker", get(upgrade_handler))
            .with_state(self)
    }

    /// Spawn the periodic purge of expired (non-resumable) sessions.
    pub fn spawn_grace_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        let interval = std::time::Duration::from_secs(
            server.config.session.resume_grace_seconds.max(1),
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let purged = server.registry.purge_expired();
                if purged > 0 {
                    tracing::info!(purged, "purged expired worker sessions");
                }
            }
        })
    }

    /// Drive one accepted WebSocket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to serialize outbound envelope");
                    }
                }
            }
        });

        let shared = ConnectionShared::new(
            self.config.session.window_size,
            self.config.session.ack_retry.clone(),
            outbound_tx,
        );
        let mut driver = ConnectionDriver::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.tokens),
            self.config.session.clone(),
            self.config.server.auth_token.clone(),
            self.scheduler_id.clone(),
            Arc::clone(&self.sink),
            shared,
        );
        tracing::info!("worker connection opened");

        while let Some(message) = ws_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    tracing::info!(%error, "worker connection errored");
                    break;
                }
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                // Pings/pongs are handled by axum; binary frames are not
                // part of the protocol.
                _ => continue,
            };
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::warn!(%error, "dropping malformed envelope");
                    continue;
                }
            };
            let ready = driver.handle_envelope(envelope).await;
            let session = driver.session();
            for envelope in ready {
                self.handler.handle(envelope, session.clone()).await;
            }
            if driver.closing() {
                break;
            }
        }

        driver.on_disconnect();
        writer.abort();
        if let Some(session) = driver.session() {
            tracing::info!(worker = %session.worker_name, "worker marked disconnected");
        } else {
            tracing::info!("worker connection closed before handshake");
        }
    }
}

async fn upgrade_handler(
    State(server): State<Arc<ControlPlaneServer>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| server.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceIndex;
    use lattice_events::{BroadcastSink, EventBus};
    use parking_lot::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnvelopeHandler for RecordingHandler {
        async fn handle(&self, envelope: Envelope, _session: Option<WorkerSessionSnapshot>) {
            self.seen.lock().push(envelope.kind);
        }
    }

    #[tokio::test]
    async fn router_builds_with_ws_route() {
        let registry = Arc::new(WorkerRegistry::new(InstanceIndex::in_memory(), 300));
        let tokens = Arc::new(SessionTokens::ephemeral());
        let bus = Arc::new(EventBus::new(16));
        let sink = Arc::new(BroadcastSink::new(bus));
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let server = Arc::new(ControlPlaneServer::new(
            registry,
            tokens,
            SchedulerConfig::default(),
            sink,
            handler,
            "scheduler-1".into(),
        ));
        let _router: Router = server.clone().router();
        assert!(server.registry().list().is_empty());
    }

    #[tokio::test]
    async fn handler_records_routed_frames() {
        let handler = RecordingHandler {
            seen: Mutex::new(Vec::new()),
        };
        let envelope = Envelope::new(
            "biz.exec.result",
            "t",
            lattice_protocol::Sender {
                role: lattice_protocol::Role::Worker,
                id: "w".into(),
            },
        );
        handler.handle(envelope, None).await;
        assert_eq!(handler.seen.lock().as_slice(), ["biz.exec.result"]);
    }
}
