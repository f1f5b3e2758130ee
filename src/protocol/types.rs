use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a node in the cluster.
/// Wrapper around a UUID string to ensure global uniqueness across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generates a new random UUID v4-based NodeId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Role a node plays in the cluster. Only the coordinator mutates cluster
/// state; `registry` and `monitor` nodes are passive observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
    Registry,
    Monitor,
}

/// Lifecycle state of a node as seen by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Registered and heartbeating; eligible for assignments.
    Online,
    /// Heartbeat timed out or the connection dropped.
    Offline,
    /// Currently executing a task.
    Busy,
    /// Pausing a task as the source of an in-flight migration.
    Migrating,
}

/// A member of the cluster. Created on registration, mutated only by the
/// coordinator, removed on explicit disconnect or heartbeat-timeout eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Advertised address, informational only on this transport.
    pub address: String,
    pub joined_at: u64,
    pub last_ping: u64,
}

/// Mobility class of a task. Weak relocates code only; strong relocates code
/// plus the latest execution checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Weak,
    Strong,
}

/// Task lifecycle. Terminal on `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Migrating,
    Completed,
    Failed,
}

/// Submission request for a new task. `code` names a registered bundle;
/// `custom_code` is wrapped as an ephemeral bundle instead when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub custom_code: Option<String>,
    pub migration_type: MigrationType,
    /// Opaque parameters handed to the task function.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A task owned by the coordinator. All mutations flow through the
/// coordinator in response to worker reports or protocol events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub custom_code: Option<String>,
    pub status: TaskStatus,
    pub migration_type: MigrationType,
    #[serde(default)]
    pub current_node_id: Option<NodeId>,
    /// Completion percentage in `[0, 100]`.
    pub progress: f32,
    pub created_at: u64,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Wall-clock execution time, stamped on completion.
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            name: spec.name,
            code: spec.code,
            custom_code: spec.custom_code,
            status: TaskStatus::Pending,
            migration_type: spec.migration_type,
            current_node_id: None,
            progress: 0.0,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            execution_time_ms: None,
            params: spec.params,
        }
    }
}

/// Immutable, checksummed blob of executable code plus metadata.
///
/// `checksum` is the SHA-256 of `code` and is re-verified on every load; a
/// mismatch means the bundle is corrupt and must not be assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeBundle {
    pub id: String,
    pub name: String,
    pub description: String,
    pub code: String,
    pub version: u32,
    pub checksum: String,
    pub created_at: u64,
}

impl CodeBundle {
    /// True when the stored checksum still matches the code content.
    pub fn verify(&self) -> bool {
        bundle_checksum(&self.code) == self.checksum
    }
}

/// SHA-256 content hash of a bundle's code, lowercase hex.
pub fn bundle_checksum(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

/// Serialized snapshot of a task's step counter and opaque variable map,
/// sufficient to resume execution at `current_step + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCheckpoint {
    pub id: String,
    pub task_id: TaskId,
    pub current_step: u32,
    pub total_steps: u32,
    /// Opaque key -> value map restored by the task on resume.
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub source_node_id: NodeId,
    pub created_at: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ExecutionCheckpoint {
    pub fn new(
        task_id: TaskId,
        current_step: u32,
        total_steps: u32,
        variables: serde_json::Map<String, serde_json::Value>,
        source_node_id: NodeId,
    ) -> Self {
        let mut checkpoint = Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            current_step,
            total_steps,
            variables,
            source_node_id,
            created_at: now_ms(),
            checksum: None,
        };
        checkpoint.checksum = Some(checkpoint.compute_checksum());
        checkpoint
    }

    /// Content checksum over the canonical form of the checkpoint.
    ///
    /// The canonical form is the JSON serialization of
    /// `{taskId, currentStep, totalSteps, variables}`; `serde_json` object
    /// keys serialize sorted, so the encoding is stable across processes.
    pub fn compute_checksum(&self) -> String {
        let canonical = serde_json::json!({
            "taskId": self.task_id,
            "currentStep": self.current_step,
            "totalSteps": self.total_steps,
            "variables": self.variables,
        });
        format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
    }

    /// True when the declared checksum matches the content. A checkpoint
    /// without a declared checksum fails verification.
    pub fn verify(&self) -> bool {
        match &self.checksum {
            Some(declared) => *declared == self.compute_checksum(),
            None => false,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
