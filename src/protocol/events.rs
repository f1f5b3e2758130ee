//! Event names and payload DTOs for the control channel.
//!
//! The event-name constants below are the closed wire-level set; observers
//! match on them, so the strings are frozen. Payloads are serialized into the
//! `payload` field of an [`Envelope`] and sent as one JSON text frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{
    CodeBundle, ExecutionCheckpoint, MigrationType, Node, NodeId, NodeStatus, Task, TaskId,
    TaskSpec,
};

// --- Event names (wire-level, bit-stable) ---

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const ERROR: &str = "error";
pub const NODE_REGISTER: &str = "node:register";
pub const NODE_REGISTERED: &str = "node:registered";
pub const NODE_HEARTBEAT: &str = "node:heartbeat";
pub const NODE_STATUS_UPDATE: &str = "node:status:update";
pub const NODE_LIST_UPDATE: &str = "node:list:update";
pub const NODE_STATS: &str = "node:stats";
pub const TASK_SUBMIT: &str = "task:submit";
pub const TASK_SUBMITTED: &str = "task:submitted";
pub const TASK_ASSIGN: &str = "task:assign";
pub const TASK_START: &str = "task:start";
pub const TASK_PROGRESS: &str = "task:progress";
pub const TASK_COMPLETE: &str = "task:complete";
pub const TASK_PAUSE: &str = "task:pause";
pub const TASK_ERROR: &str = "task:error";
pub const MIGRATION_REQUEST: &str = "migration:request";
pub const MIGRATION_PREPARE: &str = "migration:prepare";
pub const MIGRATION_READY: &str = "migration:ready";
pub const MIGRATION_EXECUTE: &str = "migration:execute";
pub const MIGRATION_COMPLETE: &str = "migration:complete";
pub const MIGRATION_FAILED: &str = "migration:failed";
pub const CHECKPOINT_SAVE: &str = "checkpoint:save";
pub const CHECKPOINT_SAVED: &str = "checkpoint:saved";
pub const CHECKPOINT_LOAD: &str = "checkpoint:load";
pub const CHECKPOINT_LOADED: &str = "checkpoint:loaded";
pub const BROADCAST_EVENT: &str = "broadcast:event";
pub const SYSTEM_UPDATE: &str = "system:update";
pub const LOG_MESSAGE: &str = "log:message";

/// One control-channel frame: `{event, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(event: &str, payload: &T) -> anyhow::Result<Self> {
        Ok(Self {
            event: event.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserializes the payload into the DTO expected for this event.
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// --- Payload DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub node_id: NodeId,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListPayload {
    pub nodes: Vec<Node>,
}

/// CPU/memory sample bundled with a heartbeat. Percentages in `[0, 100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatsPayload {
    pub node_id: NodeId,
    pub cpu_usage: f32,
    pub memory_usage: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    pub task: TaskSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedPayload {
    pub task_id: TaskId,
}

/// Assignment sent to a worker. A non-null `checkpoint` instructs the worker
/// to resume at `checkpoint.current_step + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPayload {
    pub task: Task,
    pub code_bundle: CodeBundle,
    #[serde(default)]
    pub checkpoint: Option<ExecutionCheckpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub task_id: TaskId,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub task_id: TaskId,
    pub current_step: u32,
    pub total_steps: u32,
    pub progress: f32,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub task_id: TaskId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausePayload {
    pub task_id: TaskId,
    #[serde(default)]
    pub require_snapshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorPayload {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequestPayload {
    pub task_id: TaskId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub migration_type: MigrationType,
}

/// Coordinator request for a checkpoint emission (recovery path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSavePayload {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSavedPayload {
    pub checkpoint: ExecutionCheckpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointLoadPayload {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointLoadedPayload {
    #[serde(default)]
    pub checkpoint: Option<ExecutionCheckpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUpdatePayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessagePayload {
    pub node_id: NodeId,
    pub level: String,
    pub message: String,
}

/// Category of a migration lifecycle broadcast, carried on `broadcast:event`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEventType {
    MigrationRequested,
    MigrationStarted,
    CheckpointSaved,
    CodeTransferred,
    StateTransferred,
    MigrationCompleted,
    MigrationFailed,
    ExecutionResumed,
    NodeFailureDetected,
    TaskRecovered,
}

/// Migration lifecycle broadcast. Observers reconstruct causality from the
/// stream of these events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationEvent {
    #[serde(rename = "type")]
    pub event_type: MigrationEventType,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub source_node_id: Option<NodeId>,
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl MigrationEvent {
    pub fn new(event_type: MigrationEventType) -> Self {
        Self {
            event_type,
            task_id: None,
            source_node_id: None,
            target_node_id: None,
            reason: None,
        }
    }

    pub fn task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }

    pub fn source(mut self, node_id: &NodeId) -> Self {
        self.source_node_id = Some(node_id.clone());
        self
    }

    pub fn target(mut self, node_id: &NodeId) -> Self {
        self.target_node_id = Some(node_id.clone());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
