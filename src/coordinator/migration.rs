//! Transactional migration protocol.
//!
//! One migration walks `PREPARE -> AWAIT_SNAPSHOT -> COMMIT -> DONE`, with
//! `ABORT` reachable from the first two stages. The transaction runs in its
//! own spawned task so the coordinator keeps serving heartbeats while the
//! snapshot is awaited; the pending waiter is a per-task oneshot raced
//! against a hard timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::events::{
    Envelope, MigrationEvent, MigrationEventType, MigrationRequestPayload, PausePayload,
    MIGRATION_COMPLETE, MIGRATION_EXECUTE, MIGRATION_FAILED, MIGRATION_PREPARE, MIGRATION_READY,
    TASK_PAUSE,
};
use crate::protocol::types::{
    ExecutionCheckpoint, MigrationType, NodeRole, NodeStatus, TaskStatus,
};

use super::service::{Coordinator, PauseWaiter};

/// Reasons a migration transaction aborts. The `Display` text is
/// wire-visible in `migration_failed` broadcasts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {0} already has a migration in flight")]
    AlreadyMigrating(String),
    #[error("task {0} is not running")]
    NotRunning(String),
    #[error("node {1} does not own task {0}")]
    NotOwner(String, String),
    #[error("source and target must be distinct nodes")]
    SameNode,
    #[error("node {0} is not available")]
    NodeUnavailable(String),
    #[error("code bundle {0} could not be resolved")]
    BundleUnresolved(String),
    #[error("timeout")]
    SnapshotTimeout,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("migration superseded by failure recovery")]
    Superseded,
}

impl Coordinator {
    /// Entry point used by the message handler; logs the outcome.
    pub(crate) async fn run_migration(
        self: std::sync::Arc<Self>,
        request: MigrationRequestPayload,
    ) {
        let task_id = request.task_id.clone();
        match self.migrate(request).await {
            Ok(()) => {
                tracing::info!("Migration of task {} committed", task_id.0);
            }
            Err(e) => {
                tracing::warn!("Migration of task {} aborted: {}", task_id.0, e);
            }
        }
    }

    /// Runs one migration transaction to completion.
    pub(crate) async fn migrate(
        &self,
        request: MigrationRequestPayload,
    ) -> Result<(), MigrationError> {
        // PREPARE: validate ownership and availability, mark the task
        // migrating, and install the pause waiter — all under one lock so a
        // concurrent request for the same task cannot pass this stage.
        let waiter_rx = {
            let mut state = self.state.lock().await;

            let task = state
                .tasks
                .get(&request.task_id)
                .ok_or_else(|| MigrationError::TaskNotFound(request.task_id.0.clone()))?;

            match task.status {
                TaskStatus::Migrating => {
                    return Err(MigrationError::AlreadyMigrating(request.task_id.0.clone()))
                }
                TaskStatus::Running => {}
                _ => return Err(MigrationError::NotRunning(request.task_id.0.clone())),
            }

            if task.current_node_id.as_ref() != Some(&request.source_node_id) {
                return Err(MigrationError::NotOwner(
                    request.task_id.0.clone(),
                    request.source_node_id.0.clone(),
                ));
            }
            if request.source_node_id == request.target_node_id {
                return Err(MigrationError::SameNode);
            }

            let source_up = state
                .nodes
                .get(&request.source_node_id)
                .map(|node| node.status != NodeStatus::Offline)
                .unwrap_or(false);
            if !source_up {
                return Err(MigrationError::NodeUnavailable(
                    request.source_node_id.0.clone(),
                ));
            }

            let target_ready = state
                .nodes
                .get(&request.target_node_id)
                .map(|node| node.role == NodeRole::Worker && node.status == NodeStatus::Online)
                .unwrap_or(false);
            if !target_ready {
                return Err(MigrationError::NodeUnavailable(
                    request.target_node_id.0.clone(),
                ));
            }

            let task = state
                .tasks
                .get(&request.task_id)
                .ok_or_else(|| MigrationError::TaskNotFound(request.task_id.0.clone()))?;
            if self.resolve_bundle_for(task).is_none() {
                return Err(MigrationError::BundleUnresolved(task.code.clone()));
            }

            if let Some(task) = state.tasks.get_mut(&request.task_id) {
                task.status = TaskStatus::Migrating;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(
                request.task_id.clone(),
                PauseWaiter {
                    mode: request.migration_type,
                    source: request.source_node_id.clone(),
                    tx,
                },
            );
            rx
        };

        if let Ok(envelope) = Envelope::new(MIGRATION_PREPARE, &request) {
            self.broadcast(envelope);
        }
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::MigrationRequested)
                .task(&request.task_id)
                .source(&request.source_node_id)
                .target(&request.target_node_id),
        );
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::MigrationStarted).task(&request.task_id),
        );

        let pause = PausePayload {
            task_id: request.task_id.clone(),
            require_snapshot: request.migration_type == MigrationType::Strong,
        };
        let delivered = Envelope::new(TASK_PAUSE, &pause)
            .map(|envelope| self.send_to(&request.source_node_id, envelope))
            .unwrap_or(false);
        if !delivered {
            return self
                .abort_migration(
                    &request,
                    MigrationError::NodeUnavailable(request.source_node_id.0.clone()),
                )
                .await;
        }

        // AWAIT_SNAPSHOT: strong waits for a checksum-validated checkpoint,
        // weak for the source's pause ack. Other traffic keeps flowing; this
        // task is parked on the oneshot.
        let timeout = Duration::from_millis(self.config.snapshot_timeout_ms);
        let checkpoint: Option<ExecutionCheckpoint> =
            match tokio::time::timeout(timeout, waiter_rx).await {
                Err(_elapsed) => {
                    return self
                        .abort_migration(&request, MigrationError::SnapshotTimeout)
                        .await
                }
                Ok(Err(_dropped)) => {
                    return self
                        .abort_migration(&request, MigrationError::Superseded)
                        .await
                }
                Ok(Ok(Err(e))) => return self.abort_migration(&request, e).await,
                Ok(Ok(Ok(checkpoint))) => checkpoint,
            };

        if let Ok(envelope) = Envelope::new(MIGRATION_READY, &request) {
            self.broadcast(envelope);
        }

        // COMMIT: flip ownership and dispatch the target assignment. The
        // checkpoint (strong) or pause ack (weak) is already in hand, so the
        // required external ordering holds.
        {
            let mut state = self.state.lock().await;
            state.waiters.remove(&request.task_id);

            let target_ready = state
                .nodes
                .get(&request.target_node_id)
                .map(|node| node.status == NodeStatus::Online)
                .unwrap_or(false);
            if !target_ready {
                drop(state);
                return self
                    .abort_migration(
                        &request,
                        MigrationError::NodeUnavailable(request.target_node_id.0.clone()),
                    )
                    .await;
            }

            let (bundle, code) = match state.tasks.get(&request.task_id) {
                Some(task) => (self.resolve_bundle_for(task), task.code.clone()),
                None => (None, request.task_id.0.clone()),
            };
            let Some(bundle) = bundle else {
                drop(state);
                return self
                    .abort_migration(&request, MigrationError::BundleUnresolved(code))
                    .await;
            };

            let Some(task) = state.tasks.get_mut(&request.task_id) else {
                drop(state);
                return self
                    .abort_migration(
                        &request,
                        MigrationError::TaskNotFound(request.task_id.0.clone()),
                    )
                    .await;
            };
            task.current_node_id = Some(request.target_node_id.clone());
            task.status = TaskStatus::Running;
            if request.migration_type == MigrationType::Weak {
                task.progress = 0.0;
            }
            let task = task.clone();

            if let Some(source) = state.nodes.get_mut(&request.source_node_id) {
                source.status = NodeStatus::Online;
            }
            if let Some(target) = state.nodes.get_mut(&request.target_node_id) {
                target.status = NodeStatus::Busy;
            }

            self.send_assignment(&request.target_node_id, task, bundle, checkpoint.clone());
            self.broadcast_node_list(&state);
        }

        if let Ok(envelope) = Envelope::new(MIGRATION_EXECUTE, &request) {
            self.broadcast(envelope);
        }
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::CodeTransferred)
                .task(&request.task_id)
                .target(&request.target_node_id),
        );
        if checkpoint.is_some() {
            self.broadcast_migration_event(
                MigrationEvent::new(MigrationEventType::StateTransferred)
                    .task(&request.task_id)
                    .target(&request.target_node_id),
            );
        }
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::MigrationCompleted)
                .task(&request.task_id)
                .source(&request.source_node_id)
                .target(&request.target_node_id),
        );
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::ExecutionResumed)
                .task(&request.task_id)
                .target(&request.target_node_id),
        );
        if let Ok(envelope) = Envelope::new(MIGRATION_COMPLETE, &request) {
            self.broadcast(envelope);
        }

        // DONE.
        self.system_update(&format!(
            "task {} migrated from {} to {}",
            request.task_id.0, request.source_node_id.0, request.target_node_id.0
        ));

        Ok(())
    }

    /// ABORT: leave the task recoverable. If the source is still reachable
    /// the task reverts to running there (re-dispatched with the latest
    /// checkpoint for strong, from scratch for weak); otherwise recovery
    /// takes over.
    async fn abort_migration(
        &self,
        request: &MigrationRequestPayload,
        error: MigrationError,
    ) -> Result<(), MigrationError> {
        let mut defer_to_recovery = false;
        {
            let mut state = self.state.lock().await;
            state.waiters.remove(&request.task_id);

            let still_ours = state
                .tasks
                .get(&request.task_id)
                .map(|task| {
                    task.status == TaskStatus::Migrating
                        && task.current_node_id.as_ref() == Some(&request.source_node_id)
                })
                .unwrap_or(false);

            if still_ours {
                let source_reachable = state
                    .nodes
                    .get(&request.source_node_id)
                    .map(|node| node.status != NodeStatus::Offline)
                    .unwrap_or(false)
                    && self.is_connected(&request.source_node_id);

                if source_reachable {
                    let bundle = state
                        .tasks
                        .get(&request.task_id)
                        .and_then(|task| self.resolve_bundle_for(task));

                    let Some(task) = state.tasks.get_mut(&request.task_id) else {
                        return Err(error);
                    };
                    task.status = TaskStatus::Running;
                    if request.migration_type == MigrationType::Weak {
                        task.progress = 0.0;
                    }
                    let task = task.clone();

                    if let Some(source) = state.nodes.get_mut(&request.source_node_id) {
                        source.status = NodeStatus::Busy;
                    }

                    if let Some(bundle) = bundle {
                        let checkpoint = match request.migration_type {
                            MigrationType::Strong => {
                                self.registry.latest_checkpoint(&request.task_id)
                            }
                            MigrationType::Weak => None,
                        };
                        self.send_assignment(&request.source_node_id, task, bundle, checkpoint);
                    }
                    self.broadcast_node_list(&state);
                } else {
                    defer_to_recovery = true;
                }
            }
        }

        tracing::warn!(
            "Migration of task {} aborted at {}: {}",
            request.task_id.0,
            request.source_node_id.0,
            error
        );
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::MigrationFailed)
                .task(&request.task_id)
                .source(&request.source_node_id)
                .target(&request.target_node_id)
                .reason(error.to_string()),
        );
        if let Ok(envelope) = Envelope::new(MIGRATION_FAILED, request) {
            self.broadcast(envelope);
        }

        if defer_to_recovery {
            self.recover_node(request.source_node_id.clone()).await;
        }

        Err(error)
    }
}
