//! Facade for worker session access and outbound messaging.

use std::sync::Arc;

use lattice_protocol::Envelope;

use crate::error::SessionError;
use crate::registry::{SessionQuery, WorkerRegistry, WorkerSessionSnapshot};

/// Single entrypoint for session queries plus outbound envelope delivery.
#[derive(Clone)]
pub struct WorkerGateway {
    registry: Arc<WorkerRegistry>,
    scheduler_id: String,
}

impl WorkerGateway {
    /// Wrap a registry.
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>, scheduler_id: impl Into<String>) -> Self {
        Self {
            registry,
            scheduler_id: scheduler_id.into(),
        }
    }

    /// The scheduler identity stamped on outbound envelopes.
    #[must_use]
    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }

    /// Query sessions with the given filters.
    #[must_use]
    pub fn query(&self, query: &SessionQuery<'_>) -> Vec<WorkerSessionSnapshot> {
        self.registry.query(query)
    }

    /// Snapshot every session.
    #[must_use]
    pub fn list(&self) -> Vec<WorkerSessionSnapshot> {
        self.registry.list()
    }

    /// Send an envelope to a worker addressed by instance id or label.
    ///
    /// Business frames consume a send-window credit and may await one.
    pub async fn send_envelope(
        &self,
        worker_ref: &str,
        envelope: Envelope,
    ) -> Result<(), SessionError> {
        let Some(connection) = self.registry.connection(worker_ref) else {
            return Err(SessionError::UnknownWorker(worker_ref.to_owned()));
        };
        connection.send(envelope).await
    }
}
