//! Recovery Tests
//!
//! Cover the rebinding policy: weak restart vs strong resume, degradation
//! when no checkpoint exists, exhaustion of workers, and the rule that the
//! failed node is never selected again.

use crate::coordinator::ClusterState;
use crate::protocol::types::{
    now_ms, ExecutionCheckpoint, MigrationType, Node, NodeId, NodeRole, NodeStatus, Task,
    TaskSpec, TaskStatus,
};
use crate::recovery::{RecoveryAction, RecoveryManager};
use crate::registry::CodeRegistry;

fn worker(name: &str, joined_at: u64, status: NodeStatus) -> Node {
    Node {
        id: NodeId(format!("node-{}", name)),
        name: name.to_string(),
        role: NodeRole::Worker,
        status,
        address: "127.0.0.1:0".to_string(),
        joined_at,
        last_ping: now_ms(),
    }
}

fn task_on(node: &NodeId, migration_type: MigrationType, status: TaskStatus) -> Task {
    let mut task = Task::from_spec(TaskSpec {
        name: "count".to_string(),
        code: "count_sequence".to_string(),
        custom_code: None,
        migration_type,
        params: serde_json::json!({}),
    });
    task.status = status;
    task.current_node_id = Some(node.clone());
    task.progress = 40.0;
    task
}

fn state_with(nodes: Vec<Node>, tasks: Vec<Task>) -> ClusterState {
    let mut state = ClusterState::default();
    for node in nodes {
        state.nodes.insert(node.id.clone(), node);
    }
    for task in tasks {
        state.tasks.insert(task.id.clone(), task);
    }
    state
}

#[test]
fn test_weak_task_restarts_without_checkpoint() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![worker("b", 1, NodeStatus::Online)],
        vec![task_on(&failed, MigrationType::Weak, TaskStatus::Running)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        RecoveryAction::Reassign {
            target,
            checkpoint,
            degraded,
            ..
        } => {
            assert_eq!(target.0, "node-b");
            assert!(checkpoint.is_none());
            assert!(!degraded);
        }
        other => panic!("expected reassignment, got {:?}", other),
    }
}

#[test]
fn test_strong_task_resumes_from_latest_checkpoint() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let task = task_on(&failed, MigrationType::Strong, TaskStatus::Running);

    let mut variables = serde_json::Map::new();
    variables.insert("count".to_string(), serde_json::json!(30));
    registry
        .save_checkpoint(ExecutionCheckpoint::new(
            task.id.clone(),
            30,
            100,
            variables,
            failed.clone(),
        ))
        .unwrap();

    let state = state_with(vec![worker("b", 1, NodeStatus::Online)], vec![task]);
    let actions = RecoveryManager::new(registry).plan(&state, &failed);

    match &actions[0] {
        RecoveryAction::Reassign {
            checkpoint,
            degraded,
            ..
        } => {
            assert_eq!(checkpoint.as_ref().unwrap().current_step, 30);
            assert!(!degraded);
        }
        other => panic!("expected reassignment, got {:?}", other),
    }
}

#[test]
fn test_strong_task_without_checkpoint_degrades_to_restart() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![worker("b", 1, NodeStatus::Online)],
        vec![task_on(&failed, MigrationType::Strong, TaskStatus::Running)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    match &actions[0] {
        RecoveryAction::Reassign {
            checkpoint,
            degraded,
            ..
        } => {
            assert!(checkpoint.is_none());
            assert!(*degraded);
        }
        other => panic!("expected reassignment, got {:?}", other),
    }
}

#[test]
fn test_task_mid_migration_is_recovered() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![worker("b", 1, NodeStatus::Online)],
        vec![task_on(&failed, MigrationType::Strong, TaskStatus::Migrating)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    assert!(matches!(actions[0], RecoveryAction::Reassign { .. }));
}

#[test]
fn test_no_worker_available_fails_the_task() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![worker("c", 1, NodeStatus::Busy)],
        vec![task_on(&failed, MigrationType::Weak, TaskStatus::Running)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    assert!(matches!(actions[0], RecoveryAction::Fail { .. }));
}

#[test]
fn test_failed_node_is_never_selected_even_if_reregistered() {
    // The failed node came back online mid-recovery; it must still be
    // excluded from selection.
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let mut revenant = worker("a", 0, NodeStatus::Online);
    revenant.id = failed.clone();

    let state = state_with(
        vec![revenant],
        vec![task_on(&failed, MigrationType::Weak, TaskStatus::Running)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    assert!(matches!(actions[0], RecoveryAction::Fail { .. }));
}

#[test]
fn test_two_stranded_tasks_get_distinct_workers() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![
            worker("b", 1, NodeStatus::Online),
            worker("c", 2, NodeStatus::Online),
        ],
        vec![
            task_on(&failed, MigrationType::Weak, TaskStatus::Running),
            task_on(&failed, MigrationType::Weak, TaskStatus::Running),
        ],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    let mut targets: Vec<String> = actions
        .iter()
        .map(|action| match action {
            RecoveryAction::Reassign { target, .. } => target.0.clone(),
            other => panic!("expected reassignment, got {:?}", other),
        })
        .collect();
    targets.sort();
    assert_eq!(targets, vec!["node-b", "node-c"]);
}

#[test]
fn test_completed_tasks_are_left_alone() {
    let registry = CodeRegistry::new();
    let failed = NodeId("node-a".to_string());
    let state = state_with(
        vec![worker("b", 1, NodeStatus::Online)],
        vec![task_on(&failed, MigrationType::Weak, TaskStatus::Completed)],
    );

    let actions = RecoveryManager::new(registry).plan(&state, &failed);
    assert!(actions.is_empty());
}
