//! Environment-driven configuration.
//!
//! Every knob has a documented default; unset or unparsable variables fall
//! back silently, so a bare `cargo run` starts a working cluster.

use crate::protocol::types::NodeId;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Cluster-wide timing and threshold configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Coordinator listen port (`COORDINATOR_PORT`, default 3001).
    pub coordinator_port: u16,
    /// Worker -> coordinator ping cadence (`HEARTBEAT_INTERVAL`, default 1000 ms).
    pub heartbeat_interval_ms: u64,
    /// Age after which a node is declared offline (`HEARTBEAT_TIMEOUT`, default 4000 ms).
    pub heartbeat_timeout_ms: u64,
    /// Coordinator sweep period for stale nodes (`CHECK_INTERVAL`, default 2000 ms).
    pub check_interval_ms: u64,
    /// Default runtime checkpoint cadence (`CHECKPOINT_INTERVAL_STEPS`, default 10).
    pub checkpoint_interval_steps: u32,
    /// CPU percentage that counts as overload (`AUTO_MIGRATION_CPU_THRESHOLD`, default 90).
    pub auto_migration_cpu_threshold: f32,
    /// Sustained-overload window (`AUTO_MIGRATION_DURATION_MS`, default 5000 ms).
    pub auto_migration_duration_ms: u64,
    /// Hard timeout for the AWAIT_SNAPSHOT stage of a migration.
    pub snapshot_timeout_ms: u64,
    /// Retention of per-node CPU/memory samples.
    pub stats_retention_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            coordinator_port: 3001,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 4_000,
            check_interval_ms: 2_000,
            checkpoint_interval_steps: 10,
            auto_migration_cpu_threshold: 90.0,
            auto_migration_duration_ms: 5_000,
            snapshot_timeout_ms: 5_000,
            stats_retention_ms: 30_000,
        }
    }
}

impl ClusterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            coordinator_port: env_parse("COORDINATOR_PORT", defaults.coordinator_port),
            heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL", defaults.heartbeat_interval_ms),
            heartbeat_timeout_ms: env_parse("HEARTBEAT_TIMEOUT", defaults.heartbeat_timeout_ms),
            check_interval_ms: env_parse("CHECK_INTERVAL", defaults.check_interval_ms),
            checkpoint_interval_steps: env_parse(
                "CHECKPOINT_INTERVAL_STEPS",
                defaults.checkpoint_interval_steps,
            ),
            auto_migration_cpu_threshold: env_parse(
                "AUTO_MIGRATION_CPU_THRESHOLD",
                defaults.auto_migration_cpu_threshold,
            ),
            auto_migration_duration_ms: env_parse(
                "AUTO_MIGRATION_DURATION_MS",
                defaults.auto_migration_duration_ms,
            ),
            snapshot_timeout_ms: defaults.snapshot_timeout_ms,
            stats_retention_ms: defaults.stats_retention_ms,
        }
    }
}

/// Identity and dial target of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// `WORKER_ID`, random UUID when unset.
    pub id: NodeId,
    /// `WORKER_NAME`, derived from the id when unset.
    pub name: String,
    /// `COORDINATOR_URL`, default `http://127.0.0.1:3001`.
    pub coordinator_url: String,
}

impl WorkerIdentity {
    pub fn from_env() -> Self {
        let id = std::env::var("WORKER_ID")
            .map(NodeId)
            .unwrap_or_else(|_| NodeId::new());
        let name = std::env::var("WORKER_NAME")
            .unwrap_or_else(|_| format!("worker-{}", &id.0[..id.0.len().min(8)]));
        let coordinator_url = std::env::var("COORDINATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3001".to_string());
        Self {
            id,
            name,
            coordinator_url,
        }
    }
}
