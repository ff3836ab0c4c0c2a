//! Business handlers for inbound control-plane envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use lattice_core::codes;
use lattice_dispatch::Dispatcher;
use lattice_engine::RunRegistry;
use lattice_protocol::{
    Envelope, ErrorPayload, FeedbackPayload, NextRequestPayload, NextResponsePayload, ResultPayload,
    Role, Sender, envelope::types,
};
use lattice_session::{EnvelopeHandler, WorkerGateway, WorkerSessionSnapshot};

/// Routes business frames to the engine and dispatcher.
pub struct SchedulerHandlers {
    registry: Arc<RunRegistry>,
    dispatcher: Arc<Dispatcher>,
    gateway: WorkerGateway,
}

impl SchedulerHandlers {
    /// Assemble the handler set.
    pub fn new(
        registry: Arc<RunRegistry>,
        dispatcher: Arc<Dispatcher>,
        gateway: WorkerGateway,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            gateway,
        }
    }

    fn scheduler_sender(&self) -> Sender {
        Sender {
            role: Role::Scheduler,
            id: self.gateway.scheduler_id().to_owned(),
        }
    }

    async fn send_next_response(
        &self,
        worker_ref: &str,
        tenant: &str,
        payload: NextResponsePayload,
    ) {
        let envelope = Envelope::new(
            types::BIZ_EXEC_NEXT_RESPONSE,
            tenant.to_owned(),
            self.scheduler_sender(),
        )
        .with_corr(payload.request_id.clone());
        let envelope = match envelope.with_payload(&payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize next response");
                return;
            }
        };
        if let Err(error) = self.gateway.send_envelope(worker_ref, envelope).await {
            tracing::warn!(worker = worker_ref, %error, "failed to route next response");
        }
    }

    async fn on_result(&self, envelope: &Envelope) {
        let payload: ResultPayload = match envelope.parse_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, corr = ?envelope.corr, "invalid result payload");
                return;
            }
        };
        tracing::info!(
            run = %payload.run_id,
            task = %payload.task_id,
            status = %payload.status,
            "result received"
        );
        let tenant = envelope.tenant.clone();
        let (_, ready, next_responses) = self
            .registry
            .record_result(&payload.run_id.clone(), payload)
            .await;
        for (worker_ref, response) in next_responses {
            if let Some(worker_ref) = worker_ref {
                self.send_next_response(&worker_ref, &tenant, response).await;
            }
        }
        self.dispatcher.enqueue(ready);
    }

    async fn on_feedback(&self, envelope: &Envelope) {
        match envelope.parse_payload::<FeedbackPayload>() {
            Ok(payload) => self.registry.record_feedback(payload).await,
            Err(error) => tracing::warn!(%error, "invalid feedback payload"),
        }
    }

    async fn on_next_request(&self, envelope: &Envelope, session: Option<&WorkerSessionSnapshot>) {
        let payload: NextRequestPayload = match envelope.parse_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid next request payload");
                return;
            }
        };
        tracing::info!(
            run = %payload.run_id,
            middleware = %payload.middleware_id,
            request = %payload.request_id,
            "next request received"
        );
        let worker_name = session.map(|session| session.worker_name.clone());
        let worker_instance_id = session.map(|session| session.worker_instance_id.clone());
        let (ready, error) = self
            .registry
            .handle_next_request(
                payload.clone(),
                worker_name.as_deref(),
                worker_instance_id.as_deref(),
            )
            .await;
        if ready.is_empty() {
            if let Some(session) = session {
                let code = error.unwrap_or(codes::NEXT_UNAVAILABLE);
                let response = NextResponsePayload {
                    request_id: payload.request_id,
                    run_id: payload.run_id,
                    node_id: payload.node_id,
                    middleware_id: payload.middleware_id,
                    result: None,
                    error: Some(lattice_core::ErrorInfo::new(
                        code,
                        codes::next_error_message(code),
                    )),
                };
                self.send_next_response(&session.worker_instance_id, &envelope.tenant, response)
                    .await;
            }
            return;
        }
        self.dispatcher.enqueue(ready);
    }

    async fn on_next_response(&self, envelope: &Envelope) {
        let payload: NextResponsePayload = match envelope.parse_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid next response payload");
                return;
            }
        };
        let Some(worker_ref) = self
            .registry
            .resolve_next_response_worker(&payload.request_id)
            .await
        else {
            tracing::warn!(
                request = %payload.request_id,
                run = %payload.run_id,
                "no pending waiter for next response"
            );
            return;
        };
        self.send_next_response(&worker_ref, &envelope.tenant, payload).await;
    }

    async fn on_error(&self, envelope: &Envelope) {
        let payload: ErrorPayload = match envelope.parse_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "invalid error payload");
                return;
            }
        };
        let run_id = payload.run_id();
        match payload.code.as_str() {
            codes::CMD_CONCURRENCY_VIOLATION => {
                // Advisory: the existing in-flight task stays.
                tracing::info!(
                    corr = ?envelope.corr,
                    run = ?run_id,
                    "worker reported concurrency violation; keeping in-flight task"
                );
            }
            codes::RUNNER_CANCELLED => {
                let node_id = payload.node_id();
                let summary = self
                    .registry
                    .reset_after_worker_cancel(
                        run_id.as_deref(),
                        node_id.as_deref(),
                        envelope.corr.as_deref(),
                    )
                    .await;
                tracing::info!(
                    corr = ?envelope.corr,
                    run = ?run_id,
                    node = ?node_id,
                    "worker cancelled; node reset for retry"
                );
                // The node is queued and unblocked again: redispatch it.
                if let Some(summary) = summary {
                    let ready = self.registry.collect_ready(Some(&summary.run_id)).await;
                    self.dispatcher.enqueue(ready);
                }
            }
            _ => {
                tracing::warn!(
                    corr = ?envelope.corr,
                    code = %payload.code,
                    message = %payload.message,
                    "worker command error"
                );
                let (_, ready) = self
                    .registry
                    .record_command_error(payload, run_id.as_deref(), envelope.corr.as_deref())
                    .await;
                self.dispatcher.enqueue(ready);
            }
        }
    }

    async fn on_control_ack(&self, envelope: &Envelope) {
        let Some(for_id) = envelope.ack.as_ref().and_then(|ack| ack.for_id.clone()) else {
            tracing::debug!("ack without dispatch reference");
            return;
        };
        self.dispatcher.register_ack(&for_id).await;
    }

    /// Spawn the 1 s poller that converts expired `next()` deadlines into
    /// synthetic `next_timeout` responses.
    pub fn spawn_expired_next_poller(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let handlers = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                let expired = handlers.registry.collect_expired_next_requests().await;
                for entry in expired {
                    let response = NextResponsePayload {
                        request_id: entry.request_id.clone(),
                        run_id: entry.run_id.clone(),
                        node_id: entry.node_id.clone().unwrap_or_default(),
                        middleware_id: entry.middleware_id.clone().unwrap_or_default(),
                        result: None,
                        error: Some(lattice_core::ErrorInfo::new(
                            codes::NEXT_TIMEOUT,
                            codes::next_error_message(codes::NEXT_TIMEOUT),
                        )),
                    };
                    handlers
                        .send_next_response(&entry.worker_ref, "default", response)
                        .await;
                }
            }
        })
    }
}

#[async_trait]
impl EnvelopeHandler for SchedulerHandlers {
    async fn handle(&self, envelope: Envelope, session: Option<WorkerSessionSnapshot>) {
        match envelope.kind.as_str() {
            types::BIZ_EXEC_RESULT => self.on_result(&envelope).await,
            types::BIZ_EXEC_FEEDBACK => self.on_feedback(&envelope).await,
            types::BIZ_EXEC_NEXT_REQUEST => self.on_next_request(&envelope, session.as_ref()).await,
            types::BIZ_EXEC_NEXT_RESPONSE => self.on_next_response(&envelope).await,
            types::BIZ_EXEC_ERROR => self.on_error(&envelope).await,
            types::CONTROL_ACK => self.on_control_ack(&envelope).await,
            other => {
                tracing::warn!(kind = other, "unhandled message type");
            }
        }
    }
}
