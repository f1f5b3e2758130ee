use std::sync::Arc;

use crate::coordinator::ClusterState;
use crate::protocol::types::{ExecutionCheckpoint, MigrationType, NodeId, TaskId, TaskStatus};
use crate::registry::CodeRegistry;

/// One planned rebinding for a stranded task.
#[derive(Debug)]
pub enum RecoveryAction {
    Reassign {
        task_id: TaskId,
        target: NodeId,
        /// Present for strong tasks with a usable checkpoint; the task
        /// resumes at `checkpoint.current_step + 1`.
        checkpoint: Option<ExecutionCheckpoint>,
        /// Strong task with no checkpoint: restart instead of resume.
        degraded: bool,
    },
    Fail {
        task_id: TaskId,
    },
}

/// Plans recovery for the tasks a failed node held. Owned by the
/// coordinator; the registry is injected so tests can use independent
/// fixtures.
pub struct RecoveryManager {
    registry: Arc<CodeRegistry>,
}

impl RecoveryManager {
    pub fn new(registry: Arc<CodeRegistry>) -> Self {
        Self { registry }
    }

    /// Enumerates tasks whose `current_node_id` is the failed node and whose
    /// status is running or migrating, and picks a new worker for each.
    ///
    /// The failed node is excluded from selection even if it re-registered
    /// mid-recovery, and each chosen worker is claimed so two tasks never
    /// land on the same one.
    pub fn plan(&self, state: &ClusterState, failed: &NodeId) -> Vec<RecoveryAction> {
        let mut stranded: Vec<&TaskId> = state
            .tasks
            .values()
            .filter(|task| {
                task.current_node_id.as_ref() == Some(failed)
                    && matches!(task.status, TaskStatus::Running | TaskStatus::Migrating)
            })
            .map(|task| &task.id)
            .collect();
        stranded.sort();

        let mut claimed: Vec<NodeId> = vec![failed.clone()];
        let mut actions = Vec::new();

        for task_id in stranded {
            let task = &state.tasks[task_id];

            let exclude: Vec<&NodeId> = claimed.iter().collect();
            let Some(target) = state.find_available_worker(&exclude) else {
                actions.push(RecoveryAction::Fail {
                    task_id: task_id.clone(),
                });
                continue;
            };
            claimed.push(target.clone());

            let (checkpoint, degraded) = match task.migration_type {
                MigrationType::Weak => (None, false),
                // A task caught mid-migration may have paused without
                // emitting a snapshot; the latest available checkpoint is
                // the best truth either way.
                MigrationType::Strong => match self.registry.latest_checkpoint(task_id) {
                    Some(checkpoint) => (Some(checkpoint), false),
                    None => (None, true),
                },
            };

            actions.push(RecoveryAction::Reassign {
                task_id: task_id.clone(),
                target,
                checkpoint,
                degraded,
            });
        }

        actions
    }
}
