//! Per-connection protocol driver: handshake, windows, acks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use lattice_config::{AckRetryConfig, SessionConfig};
use lattice_core::codes;
use lattice_events::EventSink;
use lattice_protocol::{
    AckPayload, Envelope, HandshakePayload, HeartbeatPayload, PROTOCOL_VERSION,
    ReceiveWindow, Received, RegisterPayload, ResetPayload, ResumePayload, Role, SendWindow,
    Sender, SessionAcceptPayload, envelope::types,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SessionError;
use crate::registry::{WorkerRegistry, WorkerSessionSnapshot};
use crate::state::{SessionState, SessionTracker};
use crate::tokens::SessionTokens;

struct PendingAck {
    envelope: Envelope,
    session_seq: Option<u64>,
    retry: Option<JoinHandle<()>>,
}

/// The sendable half of a connection, shared with the gateway.
///
/// Owns the send window and the pending-ack retry table; every outbound
/// frame flows through [`ConnectionShared::send`].
pub struct ConnectionShared {
    send_window: SendWindow,
    outbound: mpsc::UnboundedSender<Envelope>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    ack_retry: AckRetryConfig,
}

impl ConnectionShared {
    /// Create the shared half over an outbound frame queue.
    #[must_use]
    pub fn new(
        window_size: u32,
        ack_retry: AckRetryConfig,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            send_window: SendWindow::new(window_size),
            outbound,
            pending_acks: Mutex::new(HashMap::new()),
            ack_retry,
        })
    }

    /// Send an envelope: business frames acquire a window credit and a
    /// session sequence; `ack.request` frames register a bounded resend.
    pub async fn send(self: &Arc<Self>, mut envelope: Envelope) -> Result<(), SessionError> {
        let mut assigned_seq = None;
        if !envelope.is_control() && envelope.session_seq.is_none() {
            let seq = self.send_window.acquire(&envelope.id).await?;
            envelope.session_seq = Some(seq);
            assigned_seq = Some(seq);
        }
        if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
            self.register_pending(envelope.clone(), assigned_seq);
        }
        if self.outbound.send(envelope.clone()).is_err() {
            if let Some(seq) = assigned_seq {
                self.send_window.release(seq);
            }
            self.remove_pending(&envelope.id);
            return Err(SessionError::Disconnected);
        }
        Ok(())
    }

    fn register_pending(self: &Arc<Self>, envelope: Envelope, session_seq: Option<u64>) {
        let message_id = envelope.id.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let retry_config = self.ack_retry.clone();
        let retry_id = message_id.clone();
        let retry = tokio::spawn(async move {
            let base = std::time::Duration::from_millis(retry_config.base_ms.max(50));
            let max = std::time::Duration::from_millis(retry_config.max_ms.max(retry_config.base_ms));
            let mut attempts = 0u32;
            loop {
                let delay = (base * 2u32.saturating_pow(attempts)).min(max);
                tokio::time::sleep(delay).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let resend = {
                    let pending = shared.pending_acks.lock();
                    pending.get(&retry_id).map(|entry| entry.envelope.clone())
                };
                let Some(envelope) = resend else {
                    return;
                };
                attempts += 1;
                if attempts >= retry_config.attempts {
                    tracing::error!(message = %retry_id, attempts, "ack retries exhausted; dropping frame");
                    shared.drop_pending(&retry_id);
                    return;
                }
                tracing::warn!(message = %retry_id, attempt = attempts, "resending unacked frame");
                if shared.outbound.send(envelope).is_err() {
                    shared.drop_pending(&retry_id);
                    return;
                }
            }
        });
        self.pending_acks.lock().insert(
            message_id,
            PendingAck {
                envelope,
                session_seq,
                retry: Some(retry),
            },
        );
    }

    fn drop_pending(&self, message_id: &str) {
        if let Some(entry) = self.pending_acks.lock().remove(message_id) {
            if let Some(retry) = entry.retry {
                retry.abort();
            }
            if let Some(seq) = entry.session_seq {
                self.send_window.release(seq);
            }
        }
    }

    fn remove_pending(&self, message_id: &str) {
        self.drop_pending(message_id);
    }

    /// Resolve a per-message ack, cancelling its retry timer.
    pub fn resolve_ack(&self, message_id: &str) {
        self.drop_pending(message_id);
    }

    /// Apply window-ack fields from a `control.ack` payload.
    pub fn apply_window_ack(&self, payload: &AckPayload) {
        let _ = self.send_window.apply_ack(payload);
    }

    /// Unacked business frames currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.send_window.inflight()
    }

    /// Reset the send window (non-resumed session accept).
    pub fn reset_window(&self) {
        self.send_window.reset();
    }

    /// Tear down: cancel retries and reset the window.
    pub fn close(&self) {
        let mut pending = self.pending_acks.lock();
        for (_, entry) in pending.drain() {
            if let Some(retry) = entry.retry {
                retry.abort();
            }
        }
        drop(pending);
        self.send_window.reset();
    }
}

/// Drives one worker connection through the session state machine.
pub struct ConnectionDriver {
    registry: Arc<WorkerRegistry>,
    tokens: Arc<SessionTokens>,
    config: SessionConfig,
    expected_auth_token: Option<String>,
    scheduler_id: String,
    sink: Arc<dyn EventSink>,
    shared: Arc<ConnectionShared>,
    tracker: SessionTracker,
    recv_window: ReceiveWindow<Envelope>,
    worker_instance_id: Option<String>,
    tenant: String,
    closing: bool,
}

impl ConnectionDriver {
    /// Create a driver for a fresh connection.
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        tokens: Arc<SessionTokens>,
        config: SessionConfig,
        expected_auth_token: Option<String>,
        scheduler_id: String,
        sink: Arc<dyn EventSink>,
        shared: Arc<ConnectionShared>,
    ) -> Self {
        let window_size = config.window_size;
        Self {
            registry,
            tokens,
            config,
            expected_auth_token,
            scheduler_id,
            sink,
            shared,
            tracker: SessionTracker::new(),
            recv_window: ReceiveWindow::new(window_size),
            worker_instance_id: None,
            tenant: "default".to_owned(),
            closing: false,
        }
    }

    /// `true` once the driver decided to close the connection.
    #[must_use]
    pub fn closing(&self) -> bool {
        self.closing
    }

    /// The registry snapshot for this connection's worker.
    #[must_use]
    pub fn session(&self) -> Option<WorkerSessionSnapshot> {
        self.worker_instance_id
            .as_deref()
            .and_then(|instance_id| self.registry.get(instance_id))
    }

    /// The shared sendable half.
    #[must_use]
    pub fn shared(&self) -> Arc<ConnectionShared> {
        Arc::clone(&self.shared)
    }

    /// Tear down on transport close: detach from the registry, keep the
    /// record resumable.
    pub fn on_disconnect(&mut self) {
        if let Some(instance_id) = &self.worker_instance_id {
            self.registry.mark_disconnected(instance_id);
        }
        self.shared.close();
        self.tracker.try_transition(SessionState::Backoff);
    }

    fn scheduler_sender(&self) -> Sender {
        Sender {
            role: Role::Scheduler,
            id: self.scheduler_id.clone(),
        }
    }

    async fn send_control(&self, envelope: Envelope) {
        if let Err(error) = self.shared.send(envelope).await {
            tracing::debug!(%error, "failed to send control frame");
        }
    }

    async fn send_ack(&self, acked: &Envelope) {
        let state = self.recv_window.ack_state();
        let payload = AckPayload {
            ok: Some(true),
            ack_seq: Some(state.ack_seq),
            ack_bitmap: Some(state.ack_bitmap),
            recv_window: Some(state.recv_window),
        };
        let mut envelope = Envelope::new(types::CONTROL_ACK, self.tenant.clone(), self.scheduler_sender());
        if let Some(corr) = &acked.corr {
            envelope = envelope.with_corr(corr.clone());
        }
        if let Some(seq) = acked.seq {
            envelope = envelope.with_seq(seq);
        }
        if acked.ack.as_ref().is_some_and(|ack| ack.requested()) {
            envelope = envelope.acking(acked.id.clone());
        }
        match envelope.with_payload(&payload) {
            Ok(envelope) => self.send_control(envelope).await,
            Err(error) => tracing::warn!(%error, "failed to serialize ack payload"),
        }
    }

    async fn send_reset(&mut self, code: &str, reason: &str) {
        let payload = ResetPayload {
            code: code.to_owned(),
            reason: reason.to_owned(),
        };
        let envelope =
            Envelope::new(types::CONTROL_RESET, self.tenant.clone(), self.scheduler_sender());
        if let Ok(envelope) = envelope.with_payload(&payload) {
            self.send_control(envelope).await;
        }
        self.closing = true;
        self.tracker.try_transition(SessionState::Closed);
    }

    /// Handle one inbound envelope. Returns frames to hand to the business
    /// router, strictly in session order.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Vec<Envelope> {
        let kind = envelope.kind.clone();
        match kind.as_str() {
            types::CONTROL_HANDSHAKE => {
                self.handle_handshake(&envelope).await;
                Vec::new()
            }
            types::CONTROL_REGISTER => {
                self.handle_register(&envelope).await;
                Vec::new()
            }
            types::CONTROL_RESUME => {
                self.handle_resume(&envelope).await;
                Vec::new()
            }
            types::CONTROL_HEARTBEAT => {
                self.handle_heartbeat(&envelope).await;
                Vec::new()
            }
            types::CONTROL_DRAIN => {
                if let Some(instance_id) = &self.worker_instance_id {
                    self.registry.drain(instance_id);
                }
                self.tracker.try_transition(SessionState::Draining);
                if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
                    self.send_ack(&envelope).await;
                }
                Vec::new()
            }
            types::CONTROL_ACK => {
                if let Ok(payload) = envelope.parse_payload::<AckPayload>() {
                    self.shared.apply_window_ack(&payload);
                } else {
                    tracing::warn!(id = %envelope.id, "invalid ack payload");
                }
                if let Some(for_id) = envelope.ack.as_ref().and_then(|ack| ack.for_id.clone()) {
                    self.shared.resolve_ack(&for_id);
                }
                // The router also sees acks so the dispatcher can resolve
                // its dispatch-level pending acks.
                vec![envelope]
            }
            other if other.starts_with("control.") => {
                tracing::debug!(kind = other, "ignoring unknown control frame");
                if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
                    self.send_ack(&envelope).await;
                }
                Vec::new()
            }
            _ => self.handle_business(envelope).await,
        }
    }

    async fn handle_handshake(&mut self, envelope: &Envelope) {
        let payload = match envelope.parse_payload::<HandshakePayload>() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid handshake payload");
                self.send_reset(codes::PROTOCOL_MISMATCH, "malformed handshake").await;
                return;
            }
        };
        if payload.protocol_version != PROTOCOL_VERSION {
            self.send_reset(
                codes::PROTOCOL_MISMATCH,
                &format!("unsupported protocol version {}", payload.protocol_version),
            )
            .await;
            return;
        }
        if let Some(expected) = &self.expected_auth_token
            && payload.auth_token.as_deref() != Some(expected.as_str())
        {
            self.send_reset(codes::AUTH_FAILED, "invalid auth token").await;
            return;
        }

        self.tenant = envelope.tenant.clone();
        let worker_name = payload
            .worker_name
            .clone()
            .unwrap_or_else(|| envelope.sender.id.clone());
        let instance_id = self.registry.handshake(
            payload.worker_instance_id.as_deref(),
            &worker_name,
            &self.tenant,
        );
        self.registry.attach(&instance_id, self.shared());
        self.worker_instance_id = Some(instance_id);
        self.tracker.try_transition(SessionState::Handshaking);
        self.send_ack(envelope).await;
    }

    async fn handle_register(&mut self, envelope: &Envelope) {
        let Some(instance_id) = self.worker_instance_id.clone() else {
            tracing::warn!("register before handshake; dropping");
            return;
        };
        let payload = match envelope.parse_payload::<RegisterPayload>() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid register payload");
                return;
            }
        };
        let session_id = Uuid::new_v4().to_string();
        let session_token = self.tokens.issue(&session_id);
        self.registry
            .register(&instance_id, &payload, &session_id, &session_token);
        if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
            self.send_ack(envelope).await;
        }

        for package in &payload.packages {
            let event = lattice_events::RunEvent::now(
                lattice_events::EventScope {
                    tenant: self.tenant.clone(),
                    run_id: None,
                    client_session_id: None,
                },
                lattice_events::EventData::WorkerPackage {
                    worker_instance_id: instance_id.clone(),
                    worker_name: payload.worker_name.clone().unwrap_or_default(),
                    package: serde_json::to_value(package).unwrap_or_default(),
                },
            );
            let _ = self.sink.publish(event).await;
        }

        let accept = SessionAcceptPayload {
            session_id,
            session_token,
            worker_instance_id: instance_id,
            resumed: false,
        };
        let envelope = Envelope::new(
            types::CONTROL_SESSION_ACCEPT,
            self.tenant.clone(),
            self.scheduler_sender(),
        );
        if let Ok(envelope) = envelope.with_payload(&accept) {
            self.send_control(envelope).await;
        }
        // A fresh session starts with clean windows on both sides.
        self.shared.reset_window();
        self.recv_window.reset();
        self.tracker.try_transition(SessionState::Registered);
        self.tracker.try_transition(SessionState::Heartbeating);
    }

    async fn handle_resume(&mut self, envelope: &Envelope) {
        let payload = match envelope.parse_payload::<ResumePayload>() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid resume payload");
                self.send_reset(codes::SESSION_NOT_FOUND, "malformed resume").await;
                return;
            }
        };
        self.tenant = envelope.tenant.clone();
        let resumed = self
            .registry
            .resume(&payload.session_id, |stored| stored == payload.session_token)
            .filter(|_| self.tokens.validate(&payload.session_id, &payload.session_token));
        let Some(instance_id) = resumed else {
            self.send_reset(codes::SESSION_NOT_FOUND, "session context not found").await;
            return;
        };

        self.registry.attach(&instance_id, self.shared());
        self.worker_instance_id = Some(instance_id.clone());
        self.tracker.try_transition(SessionState::Handshaking);
        if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
            self.send_ack(envelope).await;
        }
        let accept = SessionAcceptPayload {
            session_id: payload.session_id,
            session_token: payload.session_token,
            worker_instance_id: instance_id,
            resumed: true,
        };
        let envelope = Envelope::new(
            types::CONTROL_SESSION_ACCEPT,
            self.tenant.clone(),
            self.scheduler_sender(),
        );
        if let Ok(envelope) = envelope.with_payload(&accept) {
            self.send_control(envelope).await;
        }
        // Resumed sessions keep their windows.
        self.tracker.try_transition(SessionState::Heartbeating);
    }

    async fn handle_heartbeat(&mut self, envelope: &Envelope) {
        let payload = match envelope.parse_payload::<HeartbeatPayload>() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid heartbeat payload");
                return;
            }
        };
        if let Some(instance_id) = &self.worker_instance_id {
            self.registry.heartbeat(instance_id, &payload);
            if let Some(snapshot) = self.registry.get(instance_id) {
                let event = crate::heartbeat_event(&snapshot, &payload);
                let _ = self.sink.publish(event).await;
            }
        }
        if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
            self.send_ack(envelope).await;
        }
    }

    async fn handle_business(&mut self, envelope: Envelope) -> Vec<Envelope> {
        let Some(session_seq) = envelope.session_seq else {
            if envelope.ack.as_ref().is_some_and(|ack| ack.requested()) {
                self.send_ack(&envelope).await;
            }
            return vec![envelope];
        };

        let ack_template = envelope.clone();
        let outcome = self.recv_window.record(session_seq, envelope);
        // The ack always goes out: it carries the latest window state even
        // for dropped frames.
        self.send_ack(&ack_template).await;
        match outcome {
            Received::Ready(frames) => frames,
            Received::Buffered => Vec::new(),
            Received::Dropped(reason) => {
                tracing::warn!(
                    seq = session_seq,
                    kind = %ack_template.kind,
                    %reason,
                    base_seq = self.recv_window.base_seq(),
                    window = self.recv_window.size(),
                    "dropping out-of-window frame"
                );
                Vec::new()
            }
        }
    }

    /// The session config (used by the server for timers).
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
