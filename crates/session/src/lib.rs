#![warn(missing_docs)]

//! # Lattice Session
//!
//! The worker side of the scheduler: one registry record per connected
//! worker, an authenticated and sequenced session per WebSocket connection,
//! and the control-plane server that routes business frames to handlers.
//!
//! Sessions survive disconnects for a grace period so `control.resume` can
//! rebind a reconnecting worker without resetting its windows.

pub mod connection;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod state;
pub mod tokens;

use lattice_events::{EventData, EventScope, RunEvent};
use lattice_protocol::HeartbeatPayload;

pub use connection::{ConnectionDriver, ConnectionShared};
pub use error::SessionError;
pub use gateway::WorkerGateway;
pub use registry::{
    InstanceIndex, SessionQuery, WorkerHeartbeat, WorkerRegistry, WorkerSessionSnapshot,
};
pub use server::{ControlPlaneServer, EnvelopeHandler};
pub use state::{SessionState, SessionTracker};
pub use tokens::SessionTokens;

/// Build the `worker.heartbeat` projection for a session snapshot.
#[must_use]
pub fn heartbeat_event(
    snapshot: &WorkerSessionSnapshot,
    payload: &HeartbeatPayload,
) -> RunEvent {
    RunEvent::now(
        EventScope {
            tenant: snapshot.tenant.clone(),
            run_id: None,
            client_session_id: None,
        },
        EventData::WorkerHeartbeat {
            worker_instance_id: snapshot.worker_instance_id.clone(),
            worker_name: snapshot.worker_name.clone(),
            healthy: payload.healthy,
            metrics: serde_json::to_value(payload.metrics).unwrap_or_default(),
        },
    )
}
