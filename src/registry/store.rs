use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::types::{bundle_checksum, now_ms, CodeBundle, ExecutionCheckpoint, TaskId};

/// Integrity failures surfaced by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("bundle {0} not found")]
    BundleNotFound(String),
    #[error("bundle {id} is corrupt: stored checksum does not match code")]
    BundleCorrupt { id: String },
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("checkpoint step {new_step} regresses below {last_step} for task {task_id}")]
    CheckpointRegression {
        task_id: String,
        last_step: u32,
        new_step: u32,
    },
}

/// Counters exposed for observability.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_bundles: usize,
    pub total_checkpoints: usize,
    pub approx_storage_bytes: usize,
}

/// In-memory bundle + checkpoint store.
///
/// Bundles are immutable once registered; re-registering a name creates a new
/// bundle with a bumped version and repoints the alias, leaving older
/// versions retrievable by id.
pub struct CodeRegistry {
    bundles: DashMap<String, CodeBundle>,
    aliases: DashMap<String, String>,
    checkpoints: DashMap<TaskId, Vec<ExecutionCheckpoint>>,
}

impl CodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bundles: DashMap::new(),
            aliases: DashMap::new(),
            checkpoints: DashMap::new(),
        })
    }

    /// Computes the content checksum, stores the bundle, and returns it.
    pub fn register_bundle(&self, name: &str, code: &str, description: &str) -> CodeBundle {
        let version = self
            .get_bundle(name)
            .map(|previous| previous.version + 1)
            .unwrap_or(1);

        let bundle = CodeBundle {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            code: code.to_string(),
            version,
            checksum: bundle_checksum(code),
            created_at: now_ms(),
        };

        self.bundles.insert(bundle.id.clone(), bundle.clone());
        self.aliases.insert(name.to_string(), bundle.id.clone());

        tracing::info!(
            "Registered bundle '{}' v{} ({})",
            bundle.name,
            bundle.version,
            bundle.id
        );

        bundle
    }

    /// Looks up a bundle by generated id or by name alias. Every returned
    /// bundle has passed checksum verification.
    pub fn get_bundle(&self, id_or_name: &str) -> Option<CodeBundle> {
        let resolved_id = self
            .aliases
            .get(id_or_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| id_or_name.to_string());

        let bundle = self.bundles.get(&resolved_id)?.value().clone();
        if !bundle.verify() {
            tracing::error!("Bundle {} failed checksum verification on load", bundle.id);
            return None;
        }
        Some(bundle)
    }

    /// Recomputes the checksum and reports corruption.
    pub fn verify_bundle(&self, id_or_name: &str) -> Result<(), RegistryError> {
        let resolved_id = self
            .aliases
            .get(id_or_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| id_or_name.to_string());

        let bundle = self
            .bundles
            .get(&resolved_id)
            .ok_or_else(|| RegistryError::BundleNotFound(id_or_name.to_string()))?;

        if bundle.verify() {
            Ok(())
        } else {
            Err(RegistryError::BundleCorrupt {
                id: bundle.id.clone(),
            })
        }
    }

    /// Appends a checkpoint to the task's history and updates the latest
    /// pointer.
    ///
    /// Rejects checkpoints whose declared checksum does not match their
    /// content, and writes that regress below the latest `current_step`.
    pub fn save_checkpoint(&self, checkpoint: ExecutionCheckpoint) -> Result<(), RegistryError> {
        if !checkpoint.verify() {
            return Err(RegistryError::ChecksumMismatch);
        }

        let mut history = self
            .checkpoints
            .entry(checkpoint.task_id.clone())
            .or_default();

        if let Some(last) = history.last() {
            if checkpoint.current_step < last.current_step {
                return Err(RegistryError::CheckpointRegression {
                    task_id: checkpoint.task_id.0.clone(),
                    last_step: last.current_step,
                    new_step: checkpoint.current_step,
                });
            }
        }

        tracing::debug!(
            "Saved checkpoint for task {} at step {}/{}",
            checkpoint.task_id.0,
            checkpoint.current_step,
            checkpoint.total_steps
        );
        history.push(checkpoint);
        Ok(())
    }

    /// Returns the most recent checkpoint for the task.
    pub fn latest_checkpoint(&self, task_id: &TaskId) -> Option<ExecutionCheckpoint> {
        self.checkpoints
            .get(task_id)
            .and_then(|history| history.last().cloned())
    }

    /// Full checkpoint history for the task, oldest first.
    pub fn checkpoint_history(&self, task_id: &TaskId) -> Vec<ExecutionCheckpoint> {
        self.checkpoints
            .get(task_id)
            .map(|history| history.value().clone())
            .unwrap_or_default()
    }

    /// Removes all checkpoints for the task.
    pub fn clear_checkpoints(&self, task_id: &TaskId) {
        self.checkpoints.remove(task_id);
    }

    pub fn stats(&self) -> RegistryStats {
        let total_checkpoints = self
            .checkpoints
            .iter()
            .map(|entry| entry.value().len())
            .sum();

        let bundle_bytes: usize = self
            .bundles
            .iter()
            .map(|entry| entry.value().code.len())
            .sum();
        let checkpoint_bytes: usize = self
            .checkpoints
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|checkpoint| {
                        serde_json::to_string(&checkpoint.variables)
                            .map(|s| s.len())
                            .unwrap_or(0)
                    })
                    .collect::<Vec<_>>()
            })
            .sum();

        RegistryStats {
            total_bundles: self.bundles.len(),
            total_checkpoints,
            approx_storage_bytes: bundle_bytes + checkpoint_bytes,
        }
    }
}
