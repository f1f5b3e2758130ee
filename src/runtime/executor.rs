use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::protocol::events::ProgressPayload;
use crate::protocol::types::{ExecutionCheckpoint, MigrationType, NodeId, TaskId};

use super::library::TaskFn;

/// Checkpoint cadence for one execution.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub interval_steps: u32,
    pub save_on_pause: bool,
}

impl CheckpointConfig {
    /// Defaults derived from the task's mobility class: checkpointing is
    /// enabled only for strong tasks.
    pub fn for_migration(migration_type: MigrationType, interval_steps: u32) -> Self {
        Self {
            enabled: migration_type == MigrationType::Strong,
            interval_steps,
            save_on_pause: true,
        }
    }
}

/// Events the runtime emits toward the worker's connection loop.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Started { task_id: TaskId },
    Progress(ProgressPayload),
    Checkpoint(ExecutionCheckpoint),
    Paused { task_id: TaskId, at: u32 },
    Completed { task_id: TaskId, result: serde_json::Value },
    Failed { task_id: TaskId, error: String },
}

/// How a task function ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    /// The task observed the pause flag and ended cleanly at this step.
    Paused { at: u32 },
}

/// Cooperative executor for a single task on a single worker.
///
/// There is at most one active `execute` per task; the runtime is otherwise
/// passive and only reacts to the task's context calls and to `pause()`.
pub struct ExecutionRuntime {
    task_id: TaskId,
    node_id: NodeId,
    config: CheckpointConfig,
    paused: AtomicBool,
    current_step: AtomicU32,
    total_steps: AtomicU32,
    steps_since_checkpoint: AtomicU32,
    latest: Mutex<Option<ExecutionCheckpoint>>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl ExecutionRuntime {
    pub fn new(
        task_id: TaskId,
        node_id: NodeId,
        config: CheckpointConfig,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            node_id,
            config,
            paused: AtomicBool::new(false),
            current_step: AtomicU32::new(0),
            total_steps: AtomicU32::new(0),
            steps_since_checkpoint: AtomicU32::new(0),
            latest: Mutex::new(None),
            events,
        })
    }

    /// Begins execution. When `checkpoint` is present the runtime restores
    /// its counters from it and hands it to the task so variables can be
    /// restored; the task resumes at `checkpoint.current_step + 1`.
    pub async fn execute(
        self: Arc<Self>,
        entry: TaskFn,
        params: serde_json::Value,
        checkpoint: Option<ExecutionCheckpoint>,
    ) -> anyhow::Result<TaskOutcome> {
        if let Some(restored) = &checkpoint {
            self.current_step
                .store(restored.current_step, Ordering::SeqCst);
            self.total_steps
                .store(restored.total_steps, Ordering::SeqCst);
            *self.latest.lock().unwrap() = Some(restored.clone());
            tracing::info!(
                "Resuming task {} from checkpoint at step {}",
                self.task_id.0,
                restored.current_step
            );
        }

        let _ = self.events.send(RuntimeEvent::Started {
            task_id: self.task_id.clone(),
        });

        let context = TaskContext {
            runtime: self.clone(),
            params,
            checkpoint,
        };

        match entry(context).await {
            Ok(TaskOutcome::Completed(result)) => {
                let _ = self.events.send(RuntimeEvent::Completed {
                    task_id: self.task_id.clone(),
                    result: result.clone(),
                });
                Ok(TaskOutcome::Completed(result))
            }
            Ok(TaskOutcome::Paused { at }) => {
                tracing::info!("Task {} parked at step {}", self.task_id.0, at);
                let _ = self.events.send(RuntimeEvent::Paused {
                    task_id: self.task_id.clone(),
                    at,
                });
                Ok(TaskOutcome::Paused { at })
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", self.task_id.0, e);
                let _ = self.events.send(RuntimeEvent::Failed {
                    task_id: self.task_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Raises the pause flag and returns the latest checkpoint, if any has
    /// been emitted. The task ends at its next `is_paused` check.
    pub fn pause(&self) -> Option<ExecutionCheckpoint> {
        self.paused.store(true, Ordering::SeqCst);
        self.latest.lock().unwrap().clone()
    }

    pub fn latest_checkpoint(&self) -> Option<ExecutionCheckpoint> {
        self.latest.lock().unwrap().clone()
    }

    pub fn current_step(&self) -> u32 {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

/// Capabilities handed to a task function.
#[derive(Clone)]
pub struct TaskContext {
    runtime: Arc<ExecutionRuntime>,
    /// Opaque parameters from the submission.
    pub params: serde_json::Value,
    /// The checkpoint this execution resumed from, if any.
    pub checkpoint: Option<ExecutionCheckpoint>,
}

impl TaskContext {
    /// Advances the runtime counters and reports progress upstream. Counts
    /// toward the checkpoint cadence.
    pub fn report_progress(&self, current_step: u32, total_steps: u32, message: Option<String>) {
        let runtime = &self.runtime;
        runtime.current_step.store(current_step, Ordering::SeqCst);
        runtime.total_steps.store(total_steps, Ordering::SeqCst);
        runtime
            .steps_since_checkpoint
            .fetch_add(1, Ordering::SeqCst);

        let progress = if total_steps == 0 {
            0.0
        } else {
            (current_step as f32 / total_steps as f32) * 100.0
        };

        let _ = runtime.events.send(RuntimeEvent::Progress(ProgressPayload {
            task_id: runtime.task_id.clone(),
            current_step,
            total_steps,
            progress,
            message,
        }));
    }

    /// True when checkpointing is enabled and enough steps have accumulated
    /// since the last snapshot.
    pub fn should_checkpoint(&self) -> bool {
        let runtime = &self.runtime;
        runtime.config.enabled
            && runtime.steps_since_checkpoint.load(Ordering::SeqCst)
                >= runtime.config.interval_steps
    }

    /// True when a pause should be accompanied by a final snapshot.
    pub fn should_snapshot_on_pause(&self) -> bool {
        self.runtime.config.enabled && self.runtime.config.save_on_pause
    }

    /// Builds a checkpoint, resets the cadence counter, and forwards it
    /// through the runtime's event stream.
    pub fn save_checkpoint(
        &self,
        current_step: u32,
        variables: serde_json::Map<String, serde_json::Value>,
    ) -> ExecutionCheckpoint {
        let runtime = &self.runtime;
        let checkpoint = ExecutionCheckpoint::new(
            runtime.task_id.clone(),
            current_step,
            runtime.total_steps.load(Ordering::SeqCst),
            variables,
            runtime.node_id.clone(),
        );

        *runtime.latest.lock().unwrap() = Some(checkpoint.clone());
        runtime.steps_since_checkpoint.store(0, Ordering::SeqCst);

        let _ = runtime
            .events
            .send(RuntimeEvent::Checkpoint(checkpoint.clone()));
        checkpoint
    }

    /// Cooperative pause point.
    pub async fn sleep(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// True when the runtime has been asked to pause. Tasks must check this
    /// after each unit of work and end with a paused marker.
    pub fn is_paused(&self) -> bool {
        self.runtime.paused.load(Ordering::SeqCst)
    }
}
