//! Registry Tests
//!
//! Cover the integrity contract: checksum verification on load, the
//! append-only checkpoint history with monotonic steps, and alias lookups.

use crate::protocol::types::{ExecutionCheckpoint, NodeId, TaskId};
use crate::registry::store::{CodeRegistry, RegistryError};

fn checkpoint_at(task_id: &TaskId, step: u32) -> ExecutionCheckpoint {
    let mut variables = serde_json::Map::new();
    variables.insert("count".to_string(), serde_json::json!(step));
    ExecutionCheckpoint::new(task_id.clone(), step, 100, variables, NodeId::new())
}

#[test]
fn test_register_and_get_by_id_and_name() {
    let registry = CodeRegistry::new();
    let bundle = registry.register_bundle("count_sequence", "count_sequence", "counting task");

    let by_id = registry.get_bundle(&bundle.id).expect("lookup by id");
    let by_name = registry.get_bundle("count_sequence").expect("lookup by name");

    assert_eq!(by_id.id, by_name.id);
    assert_eq!(by_id.version, 1);
    assert!(by_id.verify());
}

#[test]
fn test_reregistering_a_name_bumps_version() {
    let registry = CodeRegistry::new();
    let first = registry.register_bundle("task", "v1 body", "first");
    let second = registry.register_bundle("task", "v2 body", "second");

    assert_eq!(second.version, 2);
    // Alias points at the newest version; the old bundle stays reachable by id.
    assert_eq!(registry.get_bundle("task").unwrap().id, second.id);
    assert_eq!(registry.get_bundle(&first.id).unwrap().code, "v1 body");
}

#[test]
fn test_verify_bundle_reports_missing() {
    let registry = CodeRegistry::new();
    let result = registry.verify_bundle("nope");
    assert!(matches!(result, Err(RegistryError::BundleNotFound(_))));
}

#[test]
fn test_verify_bundle_passes_for_registered() {
    let registry = CodeRegistry::new();
    registry.register_bundle("ok", "body", "fine");
    assert!(registry.verify_bundle("ok").is_ok());
}

#[test]
fn test_checkpoint_history_and_latest_pointer() {
    let registry = CodeRegistry::new();
    let task_id = TaskId::new();

    registry.save_checkpoint(checkpoint_at(&task_id, 10)).unwrap();
    registry.save_checkpoint(checkpoint_at(&task_id, 20)).unwrap();
    registry.save_checkpoint(checkpoint_at(&task_id, 30)).unwrap();

    assert_eq!(registry.checkpoint_history(&task_id).len(), 3);
    assert_eq!(registry.latest_checkpoint(&task_id).unwrap().current_step, 30);

    registry.clear_checkpoints(&task_id);
    assert!(registry.latest_checkpoint(&task_id).is_none());
    assert!(registry.checkpoint_history(&task_id).is_empty());
}

#[test]
fn test_checkpoint_steps_are_monotonic() {
    let registry = CodeRegistry::new();
    let task_id = TaskId::new();

    registry.save_checkpoint(checkpoint_at(&task_id, 20)).unwrap();
    // Equal steps are allowed; regression is not.
    registry.save_checkpoint(checkpoint_at(&task_id, 20)).unwrap();
    let result = registry.save_checkpoint(checkpoint_at(&task_id, 10));

    assert!(matches!(
        result,
        Err(RegistryError::CheckpointRegression { last_step: 20, new_step: 10, .. })
    ));
    // The rejected write did not touch the history.
    assert_eq!(registry.latest_checkpoint(&task_id).unwrap().current_step, 20);
}

#[test]
fn test_tampered_checkpoint_is_rejected() {
    let registry = CodeRegistry::new();
    let task_id = TaskId::new();

    let mut tampered = checkpoint_at(&task_id, 10);
    tampered
        .variables
        .insert("count".to_string(), serde_json::json!(9999));

    let result = registry.save_checkpoint(tampered);
    assert!(matches!(result, Err(RegistryError::ChecksumMismatch)));
    assert!(registry.latest_checkpoint(&task_id).is_none());
}

#[test]
fn test_stats_counts() {
    let registry = CodeRegistry::new();
    registry.register_bundle("a", "aaaa", "");
    registry.register_bundle("b", "bbbb", "");
    let task_id = TaskId::new();
    registry.save_checkpoint(checkpoint_at(&task_id, 1)).unwrap();
    registry.save_checkpoint(checkpoint_at(&task_id, 2)).unwrap();

    let stats = registry.stats();
    assert_eq!(stats.total_bundles, 2);
    assert_eq!(stats.total_checkpoints, 2);
    assert!(stats.approx_storage_bytes >= 8);
}
