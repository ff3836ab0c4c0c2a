//! The worker session registry: one record per known worker.
//!
//! Selection reads immutable snapshots; mutations happen only on the owning
//! connection handler. Disconnected records stay resumable for a grace
//! period before they are purged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lattice_protocol::{HeartbeatMetrics, HeartbeatPayload, PackageStatus, RegisterPayload, WorkerPackage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionShared;

/// Latest heartbeat observed from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Self-reported health flag.
    pub healthy: bool,
    /// Load metrics.
    pub metrics: HeartbeatMetrics,
    /// When the heartbeat arrived.
    pub at: DateTime<Utc>,
}

/// Read-only view of a worker session used for selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSessionSnapshot {
    /// Durable worker instance id.
    pub worker_instance_id: String,
    /// Human worker label.
    pub worker_name: String,
    /// Tenant the worker serves.
    pub tenant: String,
    /// `true` once `control.register` completed.
    pub registered: bool,
    /// `true` while a transport is attached.
    pub connected: bool,
    /// `true` after `control.drain`.
    pub draining: bool,
    /// Advertised packages.
    pub packages: Vec<WorkerPackage>,
    /// Advertised runtimes.
    pub runtime_names: Vec<String>,
    /// Advertised feature flags.
    pub feature_flags: Vec<String>,
    /// Advertised concurrency limit.
    pub concurrency: Option<u32>,
    /// Latest heartbeat.
    pub heartbeat: Option<WorkerHeartbeat>,
    /// Last heartbeat (or connect) time, for staleness checks.
    pub last_heartbeat: DateTime<Utc>,
    /// Current session id, when one is live.
    pub session_id: Option<String>,
}

impl WorkerSessionSnapshot {
    /// Age of the last heartbeat relative to `now`.
    #[must_use]
    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_heartbeat).num_milliseconds() as f64 / 1000.0
    }

    /// Returns `true` when the worker advertises the package as installed.
    #[must_use]
    pub fn supports_package(&self, name: &str, version: &str) -> bool {
        self.packages.iter().any(|package| {
            package.name == name
                && package.version == version
                && package.status == PackageStatus::Installed
        })
    }
}

struct WorkerSessionRecord {
    snapshot: WorkerSessionSnapshot,
    session_token: Option<String>,
    connection: Option<Arc<ConnectionShared>>,
    disconnected_at: Option<DateTime<Utc>>,
}

/// Filters for session queries.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery<'a> {
    /// Restrict to one tenant.
    pub tenant: Option<&'a str>,
    /// Restrict to one worker label.
    pub worker_name: Option<&'a str>,
    /// Restrict to one instance id.
    pub worker_instance_id: Option<&'a str>,
    /// Require (or forbid) an attached transport.
    pub connected: Option<bool>,
    /// Require (or forbid) completed registration.
    pub registered: Option<bool>,
    /// Require a healthy (or unhealthy) latest heartbeat.
    pub require_healthy: Option<bool>,
    /// Reject heartbeats strictly older than this many seconds.
    pub max_heartbeat_age_seconds: Option<f64>,
    /// Require an installed package by name (version paired below).
    pub package_name: Option<&'a str>,
    /// Required package version.
    pub package_version: Option<&'a str>,
    /// Upper bound on reported in-flight tasks.
    pub max_inflight: Option<u32>,
    /// Upper bound on reported latency.
    pub max_latency_ms: Option<u64>,
    /// Exclude draining workers (the default for dispatch selection).
    pub exclude_draining: bool,
}

/// File-backed index of worker name → durable instance id.
///
/// The only state the scheduler persists: it lets a worker that lost its
/// local instance id be re-issued the same one after a restart.
pub struct InstanceIndex {
    path: Option<PathBuf>,
    map: RwLock<HashMap<String, String>>,
}

impl InstanceIndex {
    /// In-memory index (tests, ephemeral deployments).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Load the index from a JSON file, starting empty when absent.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path: Some(path),
            map: RwLock::new(map),
        }
    }

    fn lookup(&self, worker_name: &str) -> Option<String> {
        self.map.read().get(worker_name).cloned()
    }

    fn store(&self, worker_name: &str, instance_id: &str) {
        self.map
            .write()
            .insert(worker_name.to_owned(), instance_id.to_owned());
        if let Some(path) = &self.path {
            let snapshot = self.map.read().clone();
            match serde_json::to_string_pretty(&snapshot) {
                Ok(raw) => {
                    if let Err(error) = std::fs::write(path, raw) {
                        tracing::warn!(%error, "failed to persist instance index");
                    }
                }
                Err(error) => tracing::warn!(%error, "failed to serialize instance index"),
            }
        }
    }
}

/// Registry of worker sessions keyed by instance id.
pub struct WorkerRegistry {
    sessions: RwLock<HashMap<String, WorkerSessionRecord>>,
    instance_index: InstanceIndex,
    resume_grace: Duration,
}

impl WorkerRegistry {
    /// Create a registry with the given resume grace period.
    #[must_use]
    pub fn new(instance_index: InstanceIndex, resume_grace_seconds: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            instance_index,
            resume_grace: Duration::seconds(resume_grace_seconds as i64),
        }
    }

    /// Allocate or reuse a durable instance id during handshake and create
    /// (or refresh) the session record.
    pub fn handshake(
        &self,
        claimed_instance_id: Option<&str>,
        worker_name: &str,
        tenant: &str,
    ) -> String {
        let instance_id = claimed_instance_id
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .or_else(|| self.instance_index.lookup(worker_name))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.instance_index.store(worker_name, &instance_id);

        let mut sessions = self.sessions.write();
        let record = sessions
            .entry(instance_id.clone())
            .or_insert_with(|| WorkerSessionRecord {
                snapshot: WorkerSessionSnapshot {
                    worker_instance_id: instance_id.clone(),
                    worker_name: worker_name.to_owned(),
                    tenant: tenant.to_owned(),
                    registered: false,
                    connected: false,
                    draining: false,
                    packages: Vec::new(),
                    runtime_names: Vec::new(),
                    feature_flags: Vec::new(),
                    concurrency: None,
                    heartbeat: None,
                    last_heartbeat: Utc::now(),
                    session_id: None,
                },
                session_token: None,
                connection: None,
                disconnected_at: None,
            });
        record.snapshot.worker_name = worker_name.to_owned();
        record.snapshot.tenant = tenant.to_owned();
        record.snapshot.last_heartbeat = Utc::now();
        record.disconnected_at = None;
        instance_id
    }

    /// Record registration: capabilities plus a freshly minted session.
    pub fn register(
        &self,
        instance_id: &str,
        payload: &RegisterPayload,
        session_id: &str,
        session_token: &str,
    ) {
        let mut sessions = self.sessions.write();
        let Some(record) = sessions.get_mut(instance_id) else {
            return;
        };
        if let Some(worker_name) = &payload.worker_name {
            record.snapshot.worker_name = worker_name.clone();
        }
        record.snapshot.packages = payload.packages.clone();
        record.snapshot.runtime_names = payload.runtime_names.clone();
        record.snapshot.feature_flags = payload.feature_flags.clone();
        record.snapshot.concurrency = payload.concurrency;
        record.snapshot.registered = true;
        record.snapshot.draining = false;
        record.snapshot.session_id = Some(session_id.to_owned());
        record.session_token = Some(session_token.to_owned());
    }

    /// Attach a live connection to the record.
    pub fn attach(&self, instance_id: &str, connection: Arc<ConnectionShared>) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(instance_id) {
            record.connection = Some(connection);
            record.snapshot.connected = true;
            record.disconnected_at = None;
        }
    }

    /// Validate a resume attempt. On success the caller rebinds its
    /// connection via [`WorkerRegistry::attach`].
    pub fn resume(
        &self,
        session_id: &str,
        token_ok: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let now = Utc::now();
        let sessions = self.sessions.read();
        sessions
            .values()
            .find(|record| {
                record.snapshot.session_id.as_deref() == Some(session_id)
                    && record
                        .session_token
                        .as_deref()
                        .is_some_and(|token| token_ok(token))
                    && record
                        .disconnected_at
                        .is_none_or(|at| now - at <= self.resume_grace)
            })
            .map(|record| record.snapshot.worker_instance_id.clone())
    }

    /// Apply a heartbeat.
    pub fn heartbeat(&self, instance_id: &str, payload: &HeartbeatPayload) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(instance_id) {
            let now = Utc::now();
            record.snapshot.heartbeat = Some(WorkerHeartbeat {
                healthy: payload.healthy,
                metrics: payload.metrics,
                at: now,
            });
            record.snapshot.last_heartbeat = now;
        }
    }

    /// Mark the worker draining: it stops being selected for new work.
    pub fn drain(&self, instance_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(instance_id) {
            record.snapshot.draining = true;
        }
    }

    /// Detach the transport, keeping the record resumable.
    pub fn mark_disconnected(&self, instance_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(instance_id) {
            record.connection = None;
            record.snapshot.connected = false;
            record.disconnected_at = Some(Utc::now());
        }
    }

    /// Drop records whose resume grace expired. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, record| {
            record
                .disconnected_at
                .is_none_or(|at| now - at <= self.resume_grace)
        });
        before - sessions.len()
    }

    /// Snapshot one session by instance id.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Option<WorkerSessionSnapshot> {
        self.sessions
            .read()
            .get(instance_id)
            .map(|record| record.snapshot.clone())
    }

    /// The live connection handle for a worker, by instance id or label.
    #[must_use]
    pub fn connection(&self, worker_ref: &str) -> Option<Arc<ConnectionShared>> {
        let sessions = self.sessions.read();
        if let Some(record) = sessions.get(worker_ref) {
            return record.connection.clone();
        }
        sessions
            .values()
            .find(|record| record.snapshot.worker_name == worker_ref && record.connection.is_some())
            .and_then(|record| record.connection.clone())
    }

    /// Query sessions with the given filters, returning snapshots.
    #[must_use]
    pub fn query(&self, query: &SessionQuery<'_>) -> Vec<WorkerSessionSnapshot> {
        let now = Utc::now();
        self.sessions
            .read()
            .values()
            .map(|record| &record.snapshot)
            .filter(|snapshot| query.tenant.is_none_or(|tenant| snapshot.tenant == tenant))
            .filter(|snapshot| {
                query
                    .worker_name
                    .is_none_or(|name| snapshot.worker_name == name)
            })
            .filter(|snapshot| {
                query
                    .worker_instance_id
                    .is_none_or(|id| snapshot.worker_instance_id == id)
            })
            .filter(|snapshot| query.connected.is_none_or(|connected| snapshot.connected == connected))
            .filter(|snapshot| {
                query
                    .registered
                    .is_none_or(|registered| snapshot.registered == registered)
            })
            .filter(|snapshot| !query.exclude_draining || !snapshot.draining)
            .filter(|snapshot| {
                query.require_healthy.is_none_or(|required| {
                    snapshot
                        .heartbeat
                        .as_ref()
                        .is_some_and(|heartbeat| heartbeat.healthy == required)
                })
            })
            .filter(|snapshot| {
                query.max_heartbeat_age_seconds.is_none_or(|max_age| {
                    // A heartbeat at exactly the cutoff is still healthy.
                    snapshot.heartbeat_age_seconds(now) <= max_age
                })
            })
            .filter(|snapshot| match (query.package_name, query.package_version) {
                (None, None) => true,
                (Some(name), Some(version)) => snapshot.supports_package(name, version),
                _ => false,
            })
            .filter(|snapshot| {
                query.max_inflight.is_none_or(|max| {
                    snapshot
                        .heartbeat
                        .as_ref()
                        .is_some_and(|heartbeat| heartbeat.metrics.inflight <= max)
                })
            })
            .filter(|snapshot| {
                query.max_latency_ms.is_none_or(|max| {
                    snapshot
                        .heartbeat
                        .as_ref()
                        .and_then(|heartbeat| heartbeat.metrics.latency_ms)
                        .is_some_and(|latency| latency <= max)
                })
            })
            .cloned()
            .collect()
    }

    /// Snapshot every session.
    #[must_use]
    pub fn list(&self) -> Vec<WorkerSessionSnapshot> {
        self.sessions
            .read()
            .values()
            .map(|record| record.snapshot.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(InstanceIndex::in_memory(), 300)
    }

    fn register_payload(packages: Vec<(&str, &str)>) -> RegisterPayload {
        RegisterPayload {
            worker_name: None,
            packages: packages
                .into_iter()
                .map(|(name, version)| WorkerPackage {
                    name: name.into(),
                    version: version.into(),
                    status: PackageStatus::Installed,
                })
                .collect(),
            runtime_names: vec!["python".into()],
            feature_flags: Vec::new(),
            concurrency: Some(4),
        }
    }

    #[test]
    fn handshake_allocates_and_reuses_instance_id() {
        let registry = registry();
        let first = registry.handshake(None, "w-1", "t");
        let again = registry.handshake(None, "w-1", "t");
        assert_eq!(first, again);
        let claimed = registry.handshake(Some("explicit-id"), "w-2", "t");
        assert_eq!(claimed, "explicit-id");
    }

    #[test]
    fn register_marks_selectable() {
        let registry = registry();
        let id = registry.handshake(None, "w-1", "t");
        registry.register(&id, &register_payload(vec![("pkg", "1.0.0")]), "sess-1", "token");
        let snapshot = registry.get(&id).unwrap();
        assert!(snapshot.registered);
        assert!(snapshot.supports_package("pkg", "1.0.0"));
        assert!(!snapshot.supports_package("pkg", "2.0.0"));
        assert_eq!(snapshot.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn resume_validates_token_and_grace() {
        let registry = registry();
        let id = registry.handshake(None, "w-1", "t");
        registry.register(&id, &register_payload(vec![]), "sess-1", "token");
        assert_eq!(
            registry.resume("sess-1", |token| token == "token"),
            Some(id.clone())
        );
        assert_eq!(registry.resume("sess-1", |_| false), None);
        assert_eq!(registry.resume("sess-other", |_| true), None);
    }

    #[test]
    fn expired_records_are_purged() {
        let registry = WorkerRegistry::new(InstanceIndex::in_memory(), 0);
        let id = registry.handshake(None, "w-1", "t");
        registry.mark_disconnected(&id);
        // Grace of zero: anything disconnected in the past is gone.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(registry.purge_expired(), 1);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn query_filters_compose() {
        let registry = registry();
        let a = registry.handshake(None, "w-a", "t");
        registry.register(&a, &register_payload(vec![("pkg", "1.0.0")]), "s-a", "tok");
        registry.heartbeat(
            &a,
            &HeartbeatPayload {
                healthy: true,
                metrics: HeartbeatMetrics {
                    inflight: 2,
                    latency_ms: Some(20),
                    queue_depth: None,
                },
            },
        );
        let b = registry.handshake(None, "w-b", "other-tenant");
        registry.register(&b, &register_payload(vec![("pkg", "1.0.0")]), "s-b", "tok");

        let hits = registry.query(&SessionQuery {
            tenant: Some("t"),
            registered: Some(true),
            package_name: Some("pkg"),
            package_version: Some("1.0.0"),
            ..SessionQuery::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].worker_name, "w-a");

        let none = registry.query(&SessionQuery {
            tenant: Some("t"),
            max_inflight: Some(1),
            ..SessionQuery::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn draining_workers_excluded_when_requested() {
        let registry = registry();
        let id = registry.handshake(None, "w-1", "t");
        registry.register(&id, &register_payload(vec![]), "s", "tok");
        registry.drain(&id);
        let excluded = registry.query(&SessionQuery {
            exclude_draining: true,
            ..SessionQuery::default()
        });
        assert!(excluded.is_empty());
        let included = registry.query(&SessionQuery::default());
        assert_eq!(included.len(), 1);
    }

    #[test]
    fn instance_index_persists_to_disk() {
        let dir = std::env::temp_dir().join(format!("lattice-index-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("instances.json");
        {
            let index = InstanceIndex::load(path.clone());
            index.store("w-1", "instance-1");
        }
        let reloaded = InstanceIndex::load(path);
        assert_eq!(reloaded.lookup("w-1").as_deref(), Some("instance-1"));
    }
}
