//! The background dispatcher task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lattice_config::DispatchConfig;
use lattice_core::codes;
use lattice_engine::{DispatchRequest, DispatchStamp, RunRegistry};
use lattice_protocol::{
    DispatchPayload, Envelope, ErrorContext, ErrorPayload, Role, Sender, envelope::types,
};
use lattice_session::{SessionQuery, WorkerGateway, WorkerSessionSnapshot};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DispatchError;
use crate::strategy::WorkerStrategy;

/// Filters the dispatcher applies when selecting a worker.
#[derive(Debug, Clone)]
pub struct SelectionFilter {
    /// Tenant the dispatch belongs to.
    pub tenant: String,
    /// Restrict to one worker label (preferred-worker pass).
    pub worker_name: Option<String>,
    /// Required package name.
    pub package_name: String,
    /// Required package version.
    pub package_version: String,
    /// Stale worker cutoff.
    pub max_heartbeat_age_seconds: Option<f64>,
}

/// Session access as the dispatcher sees it.
///
/// [`WorkerGateway`] implements this; tests substitute fakes.
#[async_trait]
pub trait DispatchGateway: Send + Sync {
    /// Candidate sessions satisfying the selection predicates.
    fn candidates(&self, filter: &SelectionFilter) -> Vec<WorkerSessionSnapshot>;
    /// Send an envelope to a worker by instance id.
    async fn send(&self, worker_instance_id: &str, envelope: Envelope)
    -> Result<(), DispatchError>;
    /// The scheduler identity stamped on outbound envelopes.
    fn scheduler_id(&self) -> String;
}

#[async_trait]
impl DispatchGateway for WorkerGateway {
    fn candidates(&self, filter: &SelectionFilter) -> Vec<WorkerSessionSnapshot> {
        self.query(&SessionQuery {
            tenant: Some(&filter.tenant),
            worker_name: filter.worker_name.as_deref(),
            connected: Some(true),
            registered: Some(true),
            package_name: Some(&filter.package_name),
            package_version: Some(&filter.package_version),
            max_heartbeat_age_seconds: filter.max_heartbeat_age_seconds,
            exclude_draining: true,
            ..SessionQuery::default()
        })
    }

    async fn send(
        &self,
        worker_instance_id: &str,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        Ok(self.send_envelope(worker_instance_id, envelope).await?)
    }

    fn scheduler_id(&self) -> String {
        WorkerGateway::scheduler_id(self).to_owned()
    }
}

struct PendingDispatch {
    request: DispatchRequest,
    waiter: JoinHandle<()>,
}

struct DispatcherInner {
    registry: Arc<RunRegistry>,
    gateway: Arc<dyn DispatchGateway>,
    config: DispatchConfig,
    strategy: WorkerStrategy,
    pending_acks: Mutex<HashMap<String, PendingDispatch>>,
    queue_tx: mpsc::UnboundedSender<DispatchRequest>,
}

/// Owns the dispatch queue and the ack-timeout bookkeeping.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    loop_task: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the dispatcher loop.
    #[must_use]
    pub fn start(
        registry: Arc<RunRegistry>,
        gateway: Arc<dyn DispatchGateway>,
        config: DispatchConfig,
    ) -> Self {
        let strategy = WorkerStrategy::resolve(&config.worker_strategy);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<DispatchRequest>();
        let inner = Arc::new(DispatcherInner {
            registry,
            gateway,
            config,
            strategy,
            pending_acks: Mutex::new(HashMap::new()),
            queue_tx,
        });
        let loop_inner = Arc::clone(&inner);
        let loop_task = tokio::spawn(async move {
            while let Some(request) = queue_rx.recv().await {
                dispatch_one(&loop_inner, request).await;
            }
        });
        Self { inner, loop_task }
    }

    /// Enqueue ready work.
    pub fn enqueue(&self, requests: Vec<DispatchRequest>) {
        for request in requests {
            let _ = self.inner.queue_tx.send(request);
        }
    }

    /// Resolve a dispatch-level ack: cancel the timeout and record the
    /// acknowledgement on the run.
    pub async fn register_ack(&self, dispatch_id: &str) {
        let pending = self.inner.pending_acks.lock().remove(dispatch_id);
        let Some(pending) = pending else {
            tracing::debug!(dispatch_id, "ack for unknown dispatch");
            return;
        };
        pending.waiter.abort();
        let request = pending.request;
        let _ = self
            .inner
            .registry
            .mark_acknowledged(&request.run_id, &request.node_id, dispatch_id)
            .await;
    }

    /// Drop ack waiters for a cancelled run. Queued requests for the run
    /// are discarded at pop time by the terminal-run check.
    pub fn cancel_run(&self, run_id: &str) {
        let mut pending = self.inner.pending_acks.lock();
        pending.retain(|_, entry| {
            if entry.request.run_id == run_id {
                entry.waiter.abort();
                false
            } else {
                true
            }
        });
    }

    /// Number of dispatches awaiting acknowledgement.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.lock().len()
    }

    /// Stop the loop task (shutdown).
    pub fn shutdown(&self) {
        self.loop_task.abort();
    }
}

fn select_worker(
    inner: &DispatcherInner,
    request: &DispatchRequest,
) -> Option<WorkerSessionSnapshot> {
    let base = SelectionFilter {
        tenant: request.tenant.clone(),
        worker_name: None,
        package_name: request.package_name.clone(),
        package_version: request.package_version.clone(),
        max_heartbeat_age_seconds: inner.config.worker_max_heartbeat_age_seconds,
    };
    if let Some(preferred) = &request.preferred_worker_name {
        let preferred_candidates = inner.gateway.candidates(&SelectionFilter {
            worker_name: Some(preferred.clone()),
            ..base.clone()
        });
        if let Some(session) = inner.strategy.select(&preferred_candidates) {
            return Some(session.clone());
        }
    }
    let candidates = inner.gateway.candidates(&base);
    inner.strategy.select(&candidates).cloned()
}

/// Middleware chain metadata must be self-consistent before the payload is
/// built: the dispatch target is either the host (no chain index) or
/// exactly `chain[chainIndex]`.
fn validate_middleware_metadata(request: &DispatchRequest) -> Result<(), DispatchError> {
    let Some(chain) = &request.middleware_chain else {
        return Ok(());
    };
    if chain.is_empty() {
        return Ok(());
    }
    let Some(host_node_id) = &request.host_node_id else {
        return Err(DispatchError::MissingHostNodeId);
    };
    if request.node_id == *host_node_id {
        if request.chain_index.is_some() {
            return Err(DispatchError::UnexpectedChainIndex);
        }
        return Ok(());
    }
    let Some(chain_index) = request.chain_index else {
        return Err(DispatchError::MissingChainIndex);
    };
    if chain_index >= chain.len() {
        return Err(DispatchError::ChainIndexOutOfBounds {
            index: chain_index,
            chain_len: chain.len(),
        });
    }
    if chain[chain_index] != request.node_id {
        return Err(DispatchError::ChainIndexMismatch {
            index: chain_index,
            node_id: request.node_id.clone(),
        });
    }
    Ok(())
}

fn build_payload(request: &DispatchRequest) -> DispatchPayload {
    DispatchPayload {
        run_id: request.run_id.clone(),
        task_id: request.task_id.clone(),
        node_id: request.node_id.clone(),
        node_type: request.node_type.clone(),
        package_name: request.package_name.clone(),
        package_version: request.package_version.clone(),
        parameters: request.parameters.clone(),
        concurrency_key: request.concurrency_key.clone(),
        host_node_id: request.host_node_id.clone(),
        middleware_chain: request.middleware_chain.clone(),
        chain_index: request.chain_index,
        resource_refs: request.resource_refs.clone(),
        affinity: request.affinity.clone(),
    }
}

async fn fail_dispatch(inner: &Arc<DispatcherInner>, request: &DispatchRequest, code: &str, message: String) {
    let payload = ErrorPayload {
        code: code.to_owned(),
        message,
        context: Some(ErrorContext {
            location: Some("scheduler.dispatch".into()),
            details: Some(serde_json::json!({
                "run_id": request.run_id,
                "node_id": request.node_id,
                "task_id": request.task_id,
                "worker": request.preferred_worker_name,
            })),
        }),
    };
    let _ = inner
        .registry
        .record_command_error(payload, Some(&request.run_id), Some(&request.task_id))
        .await;
}

async fn dispatch_one(inner: &Arc<DispatcherInner>, mut request: DispatchRequest) {
    let status = inner.registry.run_status(&request.run_id).await;
    if !status.is_some_and(|status| !status.is_terminal()) {
        tracing::info!(
            run = %request.run_id,
            node = %request.node_id,
            "skipping dispatch for finished or missing run"
        );
        return;
    }

    let Some(session) = select_worker(inner, &request) else {
        tracing::info!(
            run = %request.run_id,
            node = %request.node_id,
            attempts = request.attempts,
            "dispatch pending: no worker available"
        );
        handle_retry(inner, request, "worker unavailable").await;
        return;
    };

    if let Err(error) = validate_middleware_metadata(&request) {
        tracing::error!(
            run = %request.run_id,
            node = %request.node_id,
            %error,
            "dropping dispatch with invalid middleware metadata"
        );
        // The typed error becomes a wire code/message pair only here.
        fail_dispatch(
            inner,
            &request,
            codes::DISPATCH_INVALID_METADATA,
            error.to_string(),
        )
        .await;
        return;
    }

    let payload = build_payload(&request);
    let envelope = Envelope::new(
        types::BIZ_EXEC_DISPATCH,
        request.tenant.clone(),
        Sender {
            role: Role::Scheduler,
            id: inner.gateway.scheduler_id(),
        },
    )
    .with_corr(request.task_id.clone())
    .with_seq(request.seq)
    .request_ack();
    let envelope = match envelope.with_payload(&payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::error!(%error, "failed to serialize dispatch payload");
            return;
        }
    };
    let dispatch_id = envelope.id.clone();

    if let Err(error) = inner
        .gateway
        .send(&session.worker_instance_id, envelope)
        .await
    {
        tracing::warn!(
            run = %request.run_id,
            node = %request.node_id,
            worker = %session.worker_name,
            %error,
            "dispatch send failed"
        );
        handle_retry(inner, request, "send failed").await;
        return;
    }

    let ack_deadline =
        Utc::now() + chrono::Duration::milliseconds((inner.config.ack_timeout_seconds * 1000.0) as i64);
    if let Err(error) = inner
        .registry
        .mark_dispatched(
            &request.run_id,
            DispatchStamp {
                worker_name: session.worker_name.clone(),
                task_id: request.task_id.clone(),
                node_id: request.node_id.clone(),
                node_type: request.node_type.clone(),
                package_name: request.package_name.clone(),
                package_version: request.package_version.clone(),
                seq_used: request.seq,
                resource_refs: Some(request.resource_refs.clone()),
                affinity: request.affinity.clone(),
                dispatch_id: Some(dispatch_id.clone()),
                ack_deadline: Some(ack_deadline),
            },
        )
        .await
    {
        tracing::info!(
            run = %request.run_id,
            node = %request.node_id,
            %error,
            "run finished while dispatching; dropping"
        );
        return;
    }

    request.dispatch_id = Some(dispatch_id.clone());
    request.ack_deadline = Some(ack_deadline);
    let attempts_before = request.attempts;
    request.attempts = 0;

    let waiter = spawn_ack_waiter(Arc::clone(inner), dispatch_id.clone());
    inner.pending_acks.lock().insert(
        dispatch_id.clone(),
        PendingDispatch {
            request: request.clone(),
            waiter,
        },
    );
    tracing::info!(
        run = %request.run_id,
        node = %request.node_id,
        worker = %session.worker_name,
        %dispatch_id,
        retried = attempts_before > 0,
        "dispatched"
    );
}

fn spawn_ack_waiter(inner: Arc<DispatcherInner>, dispatch_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs_f64(inner.config.ack_timeout_seconds)).await;

        let pending = inner.pending_acks.lock().remove(&dispatch_id);
        let Some(pending) = pending else {
            return;
        };
        let mut request = pending.request;
        tracing::warn!(
            run = %request.run_id,
            node = %request.node_id,
            %dispatch_id,
            "dispatch ack timeout"
        );
        let _ = inner
            .registry
            .reset_after_ack_timeout(&request.run_id, &request.node_id, &dispatch_id)
            .await;
        request.dispatch_id = None;
        request.ack_deadline = None;
        handle_retry(&inner, request, "ack timeout").await;
    })
}

async fn handle_retry(inner: &Arc<DispatcherInner>, mut request: DispatchRequest, reason: &str) {
    let status = inner.registry.run_status(&request.run_id).await;
    if !status.is_some_and(|status| !status.is_terminal()) {
        tracing::info!(
            run = %request.run_id,
            node = %request.node_id,
            reason,
            "skip retry for finished run"
        );
        return;
    }

    request.attempts += 1;
    if request.attempts > inner.config.max_attempts {
        tracing::error!(
            run = %request.run_id,
            node = %request.node_id,
            reason,
            "dispatch giving up"
        );
        fail_dispatch(inner, &request, codes::DISPATCH_UNAVAILABLE, reason.to_owned()).await;
        return;
    }

    let exponent = request.attempts.saturating_sub(1).min(16);
    let delay = (inner.config.base_retry_seconds * f64::from(2u32.saturating_pow(exponent)))
        .min(inner.config.max_retry_seconds);
    let queue_tx = inner.queue_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        let _ = queue_tx.send(request);
    });
}
