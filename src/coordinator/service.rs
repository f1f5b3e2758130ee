use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::config::ClusterConfig;
use crate::protocol::events::*;
use crate::protocol::types::{
    now_ms, CodeBundle, ExecutionCheckpoint, MigrationType, Node, NodeId, NodeRole, NodeStatus,
    Task, TaskId, TaskSpec, TaskStatus,
};
use crate::recovery::RecoveryManager;
use crate::registry::CodeRegistry;
use crate::runtime::BUILTIN_TASKS;

use super::migration::MigrationError;
use super::monitor::StatsSample;

/// One control-channel connection. The node binding is established by the
/// first `node:register` frame; unbound connections are plain observers or
/// submitters.
pub struct ConnectionCtx {
    pub outbox: mpsc::UnboundedSender<Envelope>,
    node_id: std::sync::Mutex<Option<NodeId>>,
}

impl ConnectionCtx {
    pub fn new(outbox: mpsc::UnboundedSender<Envelope>) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            node_id: std::sync::Mutex::new(None),
        })
    }

    pub fn bind(&self, node_id: NodeId) {
        *self.node_id.lock().unwrap() = Some(node_id);
    }

    pub fn bound_node(&self) -> Option<NodeId> {
        self.node_id.lock().unwrap().clone()
    }

    fn send(&self, envelope: Envelope) {
        let _ = self.outbox.send(envelope);
    }
}

/// Pending pause acknowledgment for an in-flight migration. Strong waits for
/// a checksum-validated checkpoint, weak for the source's status update.
pub(crate) struct PauseWaiter {
    pub mode: MigrationType,
    pub source: NodeId,
    pub tx: oneshot::Sender<Result<Option<ExecutionCheckpoint>, MigrationError>>,
}

/// Authority state. Invariants cross the node and task maps, so all of it
/// sits behind one lock.
#[derive(Default)]
pub struct ClusterState {
    pub nodes: HashMap<NodeId, Node>,
    pub tasks: HashMap<TaskId, Task>,
    pub stats: HashMap<NodeId, VecDeque<StatsSample>>,
    pub(crate) waiters: HashMap<TaskId, PauseWaiter>,
}

impl ClusterState {
    /// Any online worker, excluding the given nodes. First-registered wins;
    /// the `(joined_at, id)` sort keeps selection deterministic.
    pub fn find_available_worker(&self, exclude: &[&NodeId]) -> Option<NodeId> {
        let mut candidates: Vec<&Node> = self
            .nodes
            .values()
            .filter(|node| {
                node.role == NodeRole::Worker
                    && node.status == NodeStatus::Online
                    && !exclude.contains(&&node.id)
            })
            .collect();
        candidates.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        candidates.first().map(|node| node.id.clone())
    }

    /// The task currently running (or migrating) on the node, if any.
    pub fn active_task_on(&self, node_id: &NodeId) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|task| {
                task.current_node_id.as_ref() == Some(node_id)
                    && matches!(task.status, TaskStatus::Running | TaskStatus::Migrating)
            })
            .map(|task| task.id.clone())
    }
}

/// Sole authority over the node table, task table, and migration
/// orchestration. All worker-visible state transitions pass through here.
pub struct Coordinator {
    pub config: ClusterConfig,
    pub(crate) registry: Arc<CodeRegistry>,
    pub(crate) state: Mutex<ClusterState>,
    peers: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    observers: broadcast::Sender<Envelope>,
    // Self-handle for the paths that spawn long-lived work (migrations).
    weak_self: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(config: ClusterConfig, registry: Arc<CodeRegistry>) -> Arc<Self> {
        for (name, description) in BUILTIN_TASKS {
            if registry.get_bundle(name).is_none() {
                registry.register_bundle(name, name, description);
            }
        }

        let (observers, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak_self| Self {
            config,
            registry,
            state: Mutex::new(ClusterState::default()),
            peers: DashMap::new(),
            observers,
            weak_self: weak_self.clone(),
        })
    }

    /// Spawns a migration transaction so other traffic keeps flowing while
    /// it awaits its snapshot.
    pub(crate) fn spawn_migration(&self, request: MigrationRequestPayload) {
        if let Some(coordinator) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                coordinator.run_migration(request).await;
            });
        }
    }

    pub fn registry(&self) -> &Arc<CodeRegistry> {
        &self.registry
    }

    /// Observer stream carrying every broadcast frame.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.observers.subscribe()
    }

    pub async fn node_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    pub(crate) fn is_connected(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Sends one frame to a specific node. Returns false when the node has
    /// no live connection.
    pub(crate) fn send_to(&self, node_id: &NodeId, envelope: Envelope) -> bool {
        match self.peers.get(node_id) {
            Some(peer) => peer.value().send(envelope).is_ok(),
            None => false,
        }
    }

    /// Fans a frame out to every connected node and every observer.
    pub(crate) fn broadcast(&self, envelope: Envelope) {
        for peer in self.peers.iter() {
            let _ = peer.value().send(envelope.clone());
        }
        let _ = self.observers.send(envelope);
    }

    pub(crate) fn broadcast_migration_event(&self, event: MigrationEvent) {
        if let Ok(envelope) = Envelope::new(BROADCAST_EVENT, &event) {
            self.broadcast(envelope);
        }
    }

    pub(crate) fn broadcast_node_list(&self, state: &ClusterState) {
        let payload = NodeListPayload {
            nodes: state.nodes.values().cloned().collect(),
        };
        if let Ok(envelope) = Envelope::new(NODE_LIST_UPDATE, &payload) {
            self.broadcast(envelope);
        }
    }

    pub(crate) fn system_update(&self, message: &str) {
        let payload = SystemUpdatePayload {
            message: message.to_string(),
        };
        if let Ok(envelope) = Envelope::new(SYSTEM_UPDATE, &payload) {
            self.broadcast(envelope);
        }
    }

    /// Resolves the bundle a task executes from: the ephemeral bundle for
    /// custom submissions, a registered bundle by name otherwise.
    pub(crate) fn resolve_bundle_for(&self, task: &Task) -> Option<CodeBundle> {
        if task.custom_code.is_some() {
            self.registry.get_bundle(&custom_bundle_name(&task.id))
        } else {
            self.registry.get_bundle(&task.code)
        }
    }

    /// Dispatches `task:assign`. A non-null checkpoint tells the worker to
    /// resume at `checkpoint.current_step + 1`.
    pub(crate) fn send_assignment(
        &self,
        worker_id: &NodeId,
        task: Task,
        code_bundle: CodeBundle,
        checkpoint: Option<ExecutionCheckpoint>,
    ) {
        let payload = AssignPayload {
            task,
            code_bundle,
            checkpoint,
        };
        if let Ok(envelope) = Envelope::new(TASK_ASSIGN, &payload) {
            if !self.send_to(worker_id, envelope) {
                tracing::warn!("Assignment to {} failed: no live connection", worker_id.0);
            }
        }
    }

    /// Single dispatch point for every inbound control-channel frame.
    /// Malformed payloads and unknown events are logged and dropped; nothing
    /// on this path panics.
    pub async fn handle_envelope(&self, conn: &Arc<ConnectionCtx>, envelope: Envelope) {
        let event = envelope.event.clone();
        let outcome = match event.as_str() {
            NODE_REGISTER => match envelope.parse::<RegisterPayload>() {
                Ok(payload) => {
                    self.handle_register(conn, payload.node).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            NODE_HEARTBEAT => match envelope.parse::<HeartbeatPayload>() {
                Ok(payload) => {
                    self.handle_heartbeat(payload.node_id).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            NODE_STATUS_UPDATE => match envelope.parse::<StatusUpdatePayload>() {
                Ok(payload) => {
                    self.handle_status_update(payload).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            NODE_STATS => match envelope.parse::<NodeStatsPayload>() {
                Ok(payload) => {
                    self.handle_node_stats(payload).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TASK_SUBMIT => match envelope.parse::<SubmitPayload>() {
                Ok(payload) => {
                    self.handle_submit(conn, payload.task).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TASK_START => match envelope.parse::<StartPayload>() {
                Ok(payload) => {
                    tracing::info!(
                        "Task {} started on node {}",
                        payload.task_id.0,
                        payload.node_id.0
                    );
                    self.broadcast(envelope);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TASK_PROGRESS => match envelope.parse::<ProgressPayload>() {
                Ok(payload) => {
                    self.handle_progress(payload, envelope).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TASK_COMPLETE => match envelope.parse::<CompletePayload>() {
                Ok(payload) => {
                    self.handle_complete(payload).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TASK_ERROR => match envelope.parse::<TaskErrorPayload>() {
                Ok(payload) => {
                    self.handle_task_error(payload).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MIGRATION_REQUEST => match envelope.parse::<MigrationRequestPayload>() {
                Ok(payload) => {
                    self.spawn_migration(payload);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            CHECKPOINT_SAVED => match envelope.parse::<CheckpointSavedPayload>() {
                Ok(payload) => {
                    self.handle_checkpoint_saved(payload.checkpoint).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            CHECKPOINT_LOAD => match envelope.parse::<CheckpointLoadPayload>() {
                Ok(payload) => {
                    let loaded = CheckpointLoadedPayload {
                        checkpoint: self.registry.latest_checkpoint(&payload.task_id),
                    };
                    if let Ok(reply) = Envelope::new(CHECKPOINT_LOADED, &loaded) {
                        conn.send(reply);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            LOG_MESSAGE => match envelope.parse::<LogMessagePayload>() {
                Ok(payload) => {
                    tracing::info!("[{}] {}: {}", payload.node_id.0, payload.level, payload.message);
                    self.broadcast(envelope);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            other => {
                tracing::warn!("Dropping unknown event '{}'", other);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            tracing::warn!("Dropping malformed '{}' payload: {}", event, e);
        }
    }

    async fn handle_register(&self, conn: &Arc<ConnectionCtx>, mut node: Node) {
        node.status = NodeStatus::Online;
        node.joined_at = now_ms();
        node.last_ping = node.joined_at;

        let node_id = node.id.clone();
        conn.bind(node_id.clone());
        self.peers.insert(node_id.clone(), conn.outbox.clone());

        {
            let mut state = self.state.lock().await;
            if state.nodes.contains_key(&node_id) {
                tracing::info!("Node {} re-registered, taking over session", node_id.0);
            } else {
                tracing::info!("Node {} ({}) joined as {:?}", node_id.0, node.name, node.role);
            }
            state.nodes.insert(node_id.clone(), node);

            let reply = RegisteredPayload {
                node_id: node_id.clone(),
            };
            if let Ok(envelope) = Envelope::new(NODE_REGISTERED, &reply) {
                conn.send(envelope);
            }
            self.broadcast_node_list(&state);
        }
    }

    async fn handle_heartbeat(&self, node_id: NodeId) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.last_ping = now_ms();
        }
    }

    async fn handle_status_update(&self, payload: StatusUpdatePayload) {
        let mut state = self.state.lock().await;

        // A `migrating` report is only meaningful while a pause is actually
        // pending for that node; a report racing in after the commit already
        // released the source must not wedge the node.
        let pause_pending = state
            .waiters
            .values()
            .any(|waiter| waiter.source == payload.node_id);

        match state.nodes.get_mut(&payload.node_id) {
            Some(node) => {
                if payload.status == NodeStatus::Migrating && !pause_pending {
                    tracing::debug!(
                        "Ignoring stale migrating report from {}",
                        payload.node_id.0
                    );
                } else {
                    node.status = payload.status;
                }
                node.last_ping = now_ms();
            }
            None => {
                tracing::debug!("Status update for unknown node {}", payload.node_id.0);
                return;
            }
        }

        // A source reporting `migrating` is the pause ack a weak migration
        // waits for.
        if payload.status == NodeStatus::Migrating {
            let acked: Vec<TaskId> = state
                .waiters
                .iter()
                .filter(|(_, waiter)| {
                    waiter.mode == MigrationType::Weak && waiter.source == payload.node_id
                })
                .map(|(task_id, _)| task_id.clone())
                .collect();
            for task_id in acked {
                if let Some(waiter) = state.waiters.remove(&task_id) {
                    let _ = waiter.tx.send(Ok(None));
                }
            }
        }

        self.broadcast_node_list(&state);
    }

    async fn handle_submit(&self, conn: &Arc<ConnectionCtx>, spec: TaskSpec) {
        let mut state = self.state.lock().await;
        let task = Task::from_spec(spec);
        let task_id = task.id.clone();

        let bundle = match &task.custom_code {
            Some(custom) => Some(self.registry.register_bundle(
                &custom_bundle_name(&task_id),
                custom,
                "ephemeral user-submitted bundle",
            )),
            None => self.registry.get_bundle(&task.code),
        };

        let Some(bundle) = bundle else {
            tracing::warn!(
                "Task {} names unresolvable bundle '{}'",
                task_id.0,
                task.code
            );
            let error = TaskErrorPayload {
                task_id: Some(task_id),
                error: format!("unknown code bundle '{}'", task.code),
            };
            if let Ok(envelope) = Envelope::new(TASK_ERROR, &error) {
                conn.send(envelope);
            }
            return;
        };

        state.tasks.insert(task_id.clone(), task);

        let Some(worker_id) = state.find_available_worker(&[]) else {
            tracing::warn!("No worker available for task {}", task_id.0);
            let error = TaskErrorPayload {
                task_id: Some(task_id),
                error: "no worker available".to_string(),
            };
            if let Ok(envelope) = Envelope::new(TASK_ERROR, &error) {
                conn.send(envelope);
            }
            return;
        };

        self.assign_task(&mut state, &task_id, &worker_id, bundle, None);

        let submitted = SubmittedPayload {
            task_id: task_id.clone(),
        };
        if let Ok(envelope) = Envelope::new(TASK_SUBMITTED, &submitted) {
            conn.send(envelope);
        }
        self.broadcast_node_list(&state);
        tracing::info!("Task {} assigned to worker {}", task_id.0, worker_id.0);
    }

    /// Applies §assignment semantics: task running on the worker, worker
    /// busy, start stamped once.
    pub(crate) fn assign_task(
        &self,
        state: &mut ClusterState,
        task_id: &TaskId,
        worker_id: &NodeId,
        bundle: CodeBundle,
        checkpoint: Option<ExecutionCheckpoint>,
    ) {
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::Running;
        task.current_node_id = Some(worker_id.clone());
        if task.started_at.is_none() {
            task.started_at = Some(now_ms());
        }
        let task = task.clone();

        if let Some(worker) = state.nodes.get_mut(worker_id) {
            worker.status = NodeStatus::Busy;
        }

        self.send_assignment(worker_id, task, bundle, checkpoint);
    }

    async fn handle_progress(&self, payload: ProgressPayload, envelope: Envelope) {
        {
            let mut state = self.state.lock().await;
            if let Some(task) = state.tasks.get_mut(&payload.task_id) {
                task.progress = payload.progress;
            }
        }
        // Forwarded verbatim so observers see per-step progress.
        self.broadcast(envelope);
    }

    async fn handle_complete(&self, payload: CompletePayload) {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&payload.task_id) else {
            tracing::debug!("Completion for unknown task {}", payload.task_id.0);
            return;
        };

        let completed_at = now_ms();
        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.completed_at = Some(completed_at);
        task.execution_time_ms = task
            .started_at
            .map(|started| completed_at.saturating_sub(started));
        task.result = Some(payload.result.clone());
        let worker_id = task.current_node_id.clone();

        if let Some(worker_id) = worker_id {
            if let Some(worker) = state.nodes.get_mut(&worker_id) {
                worker.status = NodeStatus::Online;
            }
        }

        self.registry.clear_checkpoints(&payload.task_id);

        tracing::info!(
            "Task {} completed in {:?} ms",
            payload.task_id.0,
            state
                .tasks
                .get(&payload.task_id)
                .and_then(|t| t.execution_time_ms)
        );

        if let Ok(envelope) = Envelope::new(TASK_COMPLETE, &payload) {
            self.broadcast(envelope);
        }
        self.broadcast_node_list(&state);
    }

    async fn handle_task_error(&self, payload: TaskErrorPayload) {
        let mut state = self.state.lock().await;
        if let Some(task_id) = &payload.task_id {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now_ms());
                task.result = Some(serde_json::json!({ "error": payload.error }));
                let worker_id = task.current_node_id.clone();
                if let Some(worker_id) = worker_id {
                    if let Some(worker) = state.nodes.get_mut(&worker_id) {
                        worker.status = NodeStatus::Online;
                    }
                }
            }
        }
        tracing::error!(
            "Task error{}: {}",
            payload
                .task_id
                .as_ref()
                .map(|id| format!(" for {}", id.0))
                .unwrap_or_default(),
            payload.error
        );
        if let Ok(envelope) = Envelope::new(TASK_ERROR, &payload) {
            self.broadcast(envelope);
        }
        self.broadcast_node_list(&state);
    }

    /// Persists a checkpoint after checksum validation and resolves any
    /// strong waiter. A checkpoint with no pending waiter is still persisted
    /// and broadcast.
    async fn handle_checkpoint_saved(&self, checkpoint: ExecutionCheckpoint) {
        let mut state = self.state.lock().await;

        if !checkpoint.verify() {
            tracing::error!(
                "Rejecting checkpoint for task {}: checksum mismatch",
                checkpoint.task_id.0
            );
            if let Some(waiter) = state.waiters.remove(&checkpoint.task_id) {
                if waiter.mode == MigrationType::Strong {
                    let _ = waiter.tx.send(Err(MigrationError::ChecksumMismatch));
                } else {
                    state.waiters.insert(checkpoint.task_id.clone(), waiter);
                }
            }
            return;
        }

        if let Err(e) = self.registry.save_checkpoint(checkpoint.clone()) {
            tracing::warn!(
                "Discarding checkpoint for task {}: {}",
                checkpoint.task_id.0,
                e
            );
            return;
        }

        if let Some(waiter) = state.waiters.remove(&checkpoint.task_id) {
            if waiter.mode == MigrationType::Strong {
                let _ = waiter.tx.send(Ok(Some(checkpoint.clone())));
            } else {
                state.waiters.insert(checkpoint.task_id.clone(), waiter);
            }
        }

        drop(state);

        let payload = CheckpointSavedPayload {
            checkpoint: checkpoint.clone(),
        };
        if let Ok(envelope) = Envelope::new(CHECKPOINT_SAVED, &payload) {
            self.broadcast(envelope);
        }
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::CheckpointSaved)
                .task(&checkpoint.task_id)
                .source(&checkpoint.source_node_id),
        );
    }

    /// Explicit connection drop: the node's entry is removed before any
    /// target selection, then the standard recovery path runs.
    pub async fn handle_disconnect(&self, node_id: NodeId) {
        self.peers.remove(&node_id);
        let known = {
            let mut state = self.state.lock().await;
            let known = state.nodes.remove(&node_id).is_some();
            if known {
                self.broadcast_node_list(&state);
            }
            known
        };
        if !known {
            return;
        }

        tracing::warn!("Node {} disconnected", node_id.0);
        self.broadcast_migration_event(
            MigrationEvent::new(MigrationEventType::NodeFailureDetected).source(&node_id),
        );
        self.recover_node(node_id).await;
    }

    /// Rebinds every task stranded on the failed node according to its
    /// mobility class, then broadcasts the outcome.
    pub(crate) async fn recover_node(&self, failed: NodeId) {
        let mut state = self.state.lock().await;

        // Cancel in-flight migrations whose source just died; the migration
        // task observes the dropped waiter and stands down.
        let orphaned: Vec<TaskId> = state
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.source == failed)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in orphaned {
            state.waiters.remove(&task_id);
        }

        let manager = RecoveryManager::new(self.registry.clone());
        let actions = manager.plan(&state, &failed);
        if actions.is_empty() {
            return;
        }

        for action in actions {
            match action {
                crate::recovery::RecoveryAction::Reassign {
                    task_id,
                    target,
                    checkpoint,
                    degraded,
                } => {
                    let bundle = state
                        .tasks
                        .get(&task_id)
                        .and_then(|task| self.resolve_bundle_for(task));
                    let Some(bundle) = bundle else {
                        tracing::error!(
                            "Recovery of task {} failed: bundle unresolvable",
                            task_id.0
                        );
                        self.fail_task(&mut state, &task_id, "code bundle unresolvable");
                        continue;
                    };

                    if degraded {
                        tracing::warn!(
                            "Task {} is strong but has no checkpoint; restarting from step 1",
                            task_id.0
                        );
                    }
                    if checkpoint.is_none() {
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.progress = 0.0;
                        }
                    }

                    self.assign_task(&mut state, &task_id, &target, bundle, checkpoint);
                    tracing::info!("Task {} recovered onto {}", task_id.0, target.0);
                    self.broadcast_migration_event(
                        MigrationEvent::new(MigrationEventType::TaskRecovered)
                            .task(&task_id)
                            .source(&failed)
                            .target(&target),
                    );
                }
                crate::recovery::RecoveryAction::Fail { task_id } => {
                    tracing::error!(
                        "Task {} lost with node {}: no worker available",
                        task_id.0,
                        failed.0
                    );
                    self.fail_task(&mut state, &task_id, "no worker available");
                    self.broadcast_migration_event(
                        MigrationEvent::new(MigrationEventType::MigrationFailed)
                            .task(&task_id)
                            .source(&failed)
                            .reason("no worker available"),
                    );
                }
            }
        }

        self.broadcast_node_list(&state);
        drop(state);
        self.system_update(&format!("recovery completed for node {}", failed.0));
    }

    fn fail_task(&self, state: &mut ClusterState, task_id: &TaskId, reason: &str) {
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.current_node_id = None;
            task.completed_at = Some(now_ms());
            task.result = Some(serde_json::json!({ "error": reason }));
        }
    }
}

pub(crate) fn custom_bundle_name(task_id: &TaskId) -> String {
    format!("custom:{}", task_id.0)
}
