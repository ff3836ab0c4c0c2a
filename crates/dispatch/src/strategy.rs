//! Worker selection strategies.
//!
//! Strategies are pure functions over session snapshots: deterministic for
//! equivalent inputs (the random strategy excepted, by definition).

use chrono::Utc;
use lattice_session::WorkerSessionSnapshot;
use rand::Rng;

const UNKNOWN_METRIC: u64 = 1_000_000;

/// Selection policy applied after predicate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerStrategy {
    /// Lexicographic `(healthRank, inflight, latencyMs, heartbeatAge)`,
    /// minimising each.
    #[default]
    Default,
    /// Fewest in-flight tasks.
    LeastInflight,
    /// Lowest reported latency.
    LeastLatency,
    /// Uniformly random.
    Random,
}

impl WorkerStrategy {
    /// Resolve a strategy by its configuration name, warning and falling
    /// back to the default on unknown values.
    #[must_use]
    pub fn resolve(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" => Self::Default,
            "least_inflight" => Self::LeastInflight,
            "least_latency" => Self::LeastLatency,
            "random" => Self::Random,
            other => {
                tracing::warn!(strategy = other, "unknown dispatch strategy; using default");
                Self::Default
            }
        }
    }

    /// Pick a session from the candidates, `None` when empty.
    #[must_use]
    pub fn select<'a>(
        &self,
        sessions: &'a [WorkerSessionSnapshot],
    ) -> Option<&'a WorkerSessionSnapshot> {
        if sessions.is_empty() {
            return None;
        }
        match self {
            Self::Default => sessions.iter().min_by_key(|session| default_score(session)),
            Self::LeastInflight => sessions.iter().min_by_key(|session| inflight_of(session)),
            Self::LeastLatency => sessions.iter().min_by_key(|session| latency_of(session)),
            Self::Random => {
                let index = rand::rng().random_range(0..sessions.len());
                sessions.get(index)
            }
        }
    }
}

fn inflight_of(session: &WorkerSessionSnapshot) -> u64 {
    session
        .heartbeat
        .as_ref()
        .map_or(UNKNOWN_METRIC, |heartbeat| u64::from(heartbeat.metrics.inflight))
}

fn latency_of(session: &WorkerSessionSnapshot) -> u64 {
    session
        .heartbeat
        .as_ref()
        .and_then(|heartbeat| heartbeat.metrics.latency_ms)
        .unwrap_or(UNKNOWN_METRIC)
}

fn default_score(session: &WorkerSessionSnapshot) -> (u8, u64, u64, i64) {
    let health_rank = match &session.heartbeat {
        None => 1,
        Some(heartbeat) if heartbeat.healthy => 0,
        Some(_) => 2,
    };
    let age_ms = (Utc::now() - session.last_heartbeat).num_milliseconds();
    (health_rank, inflight_of(session), latency_of(session), age_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use lattice_protocol::HeartbeatMetrics;
    use lattice_session::WorkerHeartbeat;
    use pretty_assertions::assert_eq;

    fn snapshot(
        name: &str,
        heartbeat: Option<(bool, u32, Option<u64>)>,
        age_seconds: i64,
    ) -> WorkerSessionSnapshot {
        let at = Utc::now() - Duration::seconds(age_seconds);
        WorkerSessionSnapshot {
            worker_instance_id: format!("{name}-id"),
            worker_name: name.into(),
            tenant: "t".into(),
            registered: true,
            connected: true,
            draining: false,
            packages: Vec::new(),
            runtime_names: Vec::new(),
            feature_flags: Vec::new(),
            concurrency: None,
            heartbeat: heartbeat.map(|(healthy, inflight, latency_ms)| WorkerHeartbeat {
                healthy,
                metrics: HeartbeatMetrics {
                    inflight,
                    latency_ms,
                    queue_depth: None,
                },
                at,
            }),
            last_heartbeat: at,
            session_id: None,
        }
    }

    #[test]
    fn resolve_known_names() {
        assert_eq!(WorkerStrategy::resolve("default"), WorkerStrategy::Default);
        assert_eq!(
            WorkerStrategy::resolve("least_inflight"),
            WorkerStrategy::LeastInflight
        );
        assert_eq!(
            WorkerStrategy::resolve(" LEAST_LATENCY "),
            WorkerStrategy::LeastLatency
        );
        assert_eq!(WorkerStrategy::resolve("random"), WorkerStrategy::Random);
        assert_eq!(WorkerStrategy::resolve("bogus"), WorkerStrategy::Default);
    }

    #[test]
    fn default_prefers_healthy_over_missing_over_unhealthy() {
        let sessions = vec![
            snapshot("unhealthy", Some((false, 0, Some(1))), 0),
            snapshot("silent", None, 0),
            snapshot("healthy", Some((true, 50, Some(500))), 0),
        ];
        let chosen = WorkerStrategy::Default.select(&sessions).unwrap();
        assert_eq!(chosen.worker_name, "healthy");
    }

    #[test]
    fn default_breaks_health_ties_by_inflight_then_latency() {
        let sessions = vec![
            snapshot("busy", Some((true, 9, Some(10))), 0),
            snapshot("idle-slow", Some((true, 1, Some(900))), 0),
            snapshot("idle-fast", Some((true, 1, Some(15))), 0),
        ];
        let chosen = WorkerStrategy::Default.select(&sessions).unwrap();
        assert_eq!(chosen.worker_name, "idle-fast");
    }

    #[test]
    fn least_inflight_ignores_latency() {
        let sessions = vec![
            snapshot("a", Some((true, 4, Some(5))), 0),
            snapshot("b", Some((true, 2, Some(800))), 0),
        ];
        let chosen = WorkerStrategy::LeastInflight.select(&sessions).unwrap();
        assert_eq!(chosen.worker_name, "b");
    }

    #[test]
    fn least_latency_treats_missing_as_worst() {
        let sessions = vec![
            snapshot("silent", Some((true, 0, None)), 0),
            snapshot("fast", Some((true, 9, Some(20))), 0),
        ];
        let chosen = WorkerStrategy::LeastLatency.select(&sessions).unwrap();
        assert_eq!(chosen.worker_name, "fast");
    }

    #[test]
    fn random_stays_within_candidates() {
        let sessions = vec![snapshot("a", None, 0), snapshot("b", None, 0)];
        for _ in 0..16 {
            let chosen = WorkerStrategy::Random.select(&sessions).unwrap();
            assert!(chosen.worker_name == "a" || chosen.worker_name == "b");
        }
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(WorkerStrategy::Default.select(&[]).is_none());
        assert!(WorkerStrategy::Random.select(&[]).is_none());
    }
}
