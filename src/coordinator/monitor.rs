//! Failure detection and the sustained-overload auto-migration detector.
//!
//! Two concerns share this file because both consume the heartbeat stream:
//! the periodic sweep that evicts silent nodes, and the per-node CPU window
//! that triggers a strong migration away from an overloaded worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClusterConfig;
use crate::protocol::events::{MigrationEvent, MigrationEventType, MigrationRequestPayload, NodeStatsPayload};
use crate::protocol::types::{now_ms, MigrationType, NodeStatus};

use super::service::Coordinator;

/// One CPU/memory reading from a worker's heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct StatsSample {
    pub at_ms: u64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
}

/// True when every sample inside the trailing window exceeds the CPU
/// threshold and at least 80% of the expected samples are present.
pub fn overload_sustained(
    samples: &VecDeque<StatsSample>,
    now_ms: u64,
    config: &ClusterConfig,
) -> bool {
    let window_start = now_ms.saturating_sub(config.auto_migration_duration_ms);
    let recent: Vec<&StatsSample> = samples
        .iter()
        .filter(|sample| sample.at_ms >= window_start)
        .collect();

    let expected =
        (config.auto_migration_duration_ms / config.heartbeat_interval_ms.max(1)).max(1) as usize;
    let min_samples = ((expected as f32) * 0.8).ceil() as usize;

    if recent.len() < min_samples.max(1) {
        return false;
    }
    recent
        .iter()
        .all(|sample| sample.cpu_usage > config.auto_migration_cpu_threshold)
}

impl Coordinator {
    /// Spawns the periodic stale-node sweep.
    pub fn spawn_background(self: Arc<Self>) {
        tracing::info!(
            "Failure sweep running every {} ms (timeout {} ms)",
            self.config.check_interval_ms,
            self.config.heartbeat_timeout_ms
        );
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
            loop {
                interval.tick().await;
                self.sweep_stale_nodes().await;
            }
        });
    }

    /// Marks nodes whose last heartbeat is older than the timeout as
    /// offline and runs recovery for each.
    pub(crate) async fn sweep_stale_nodes(&self) {
        let now = now_ms();
        let stale = {
            let mut state = self.state.lock().await;
            let stale: Vec<_> = state
                .nodes
                .values_mut()
                .filter(|node| {
                    node.status != NodeStatus::Offline
                        && now.saturating_sub(node.last_ping) > self.config.heartbeat_timeout_ms
                })
                .map(|node| {
                    node.status = NodeStatus::Offline;
                    node.id.clone()
                })
                .collect();
            if !stale.is_empty() {
                self.broadcast_node_list(&state);
            }
            stale
        };

        for node_id in stale {
            tracing::warn!("Node {} missed heartbeats, declaring offline", node_id.0);
            self.broadcast_migration_event(
                MigrationEvent::new(MigrationEventType::NodeFailureDetected).source(&node_id),
            );
            self.recover_node(node_id).await;
        }
    }

    /// Records a stats sample and fires a strong auto-migration when the
    /// node has been overloaded for the whole trailing window.
    pub(crate) async fn handle_node_stats(&self, payload: NodeStatsPayload) {
        let request = {
            let mut state = self.state.lock().await;
            let now = now_ms();

            let window = state.stats.entry(payload.node_id.clone()).or_default();
            window.push_back(StatsSample {
                at_ms: now,
                cpu_usage: payload.cpu_usage,
                memory_usage: payload.memory_usage,
            });
            while let Some(front) = window.front() {
                if now.saturating_sub(front.at_ms) > self.config.stats_retention_ms {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if !overload_sustained(window, now, &self.config) {
                return;
            }

            let Some(task_id) = state.active_task_on(&payload.node_id) else {
                return;
            };
            if state
                .tasks
                .get(&task_id)
                .map(|task| task.status != crate::protocol::types::TaskStatus::Running)
                .unwrap_or(true)
            {
                return;
            }
            let Some(target) = state.find_available_worker(&[&payload.node_id]) else {
                tracing::warn!(
                    "Node {} overloaded but no alternative worker available",
                    payload.node_id.0
                );
                return;
            };

            // Debounce: only the overloaded source's history is cleared; the
            // target keeps its window.
            state.stats.remove(&payload.node_id);

            tracing::warn!(
                "Node {} CPU above {}% for {} ms, auto-migrating task {} to {}",
                payload.node_id.0,
                self.config.auto_migration_cpu_threshold,
                self.config.auto_migration_duration_ms,
                task_id.0,
                target.0
            );

            MigrationRequestPayload {
                task_id,
                source_node_id: payload.node_id.clone(),
                target_node_id: target,
                migration_type: MigrationType::Strong,
            }
        };

        self.spawn_migration(request);
    }
}
