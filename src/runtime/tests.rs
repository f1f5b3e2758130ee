//! Runtime Tests
//!
//! Cover the cooperative contract: progress counting, checkpoint cadence,
//! pause/park behavior, resume-from-checkpoint semantics, and the built-in
//! task library.

use tokio::sync::mpsc;

use crate::protocol::types::{ExecutionCheckpoint, MigrationType, NodeId, TaskId};
use crate::runtime::executor::{
    CheckpointConfig, ExecutionRuntime, RuntimeEvent, TaskContext, TaskOutcome,
};
use crate::runtime::library::{TaskLibrary, BUILTIN_TASKS};

fn strong_config(interval_steps: u32) -> CheckpointConfig {
    CheckpointConfig {
        enabled: true,
        interval_steps,
        save_on_pause: true,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_params(total: u32) -> serde_json::Value {
    serde_json::json!({ "total": total, "stepDelayMs": 0 })
}

#[tokio::test]
async fn test_count_sequence_runs_to_completion() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(10), tx);
    let entry = TaskLibrary::builtin().resolve("count_sequence").unwrap();

    let outcome = runtime.execute(entry, count_params(5), None).await.unwrap();

    match outcome {
        TaskOutcome::Completed(result) => assert_eq!(result["finalCount"], 5),
        other => panic!("expected completion, got {:?}", other),
    }

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(RuntimeEvent::Started { .. })));
    let progress_count = events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::Progress(_)))
        .count();
    assert_eq!(progress_count, 5);
    assert!(matches!(events.last(), Some(RuntimeEvent::Completed { .. })));
}

#[tokio::test]
async fn test_checkpoint_cadence_follows_interval() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(2), tx);
    let entry = TaskLibrary::builtin().resolve("count_sequence").unwrap();

    runtime.execute(entry, count_params(6), None).await.unwrap();

    let checkpoint_steps: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            RuntimeEvent::Checkpoint(cp) => Some(cp.current_step),
            _ => None,
        })
        .collect();
    assert_eq!(checkpoint_steps, vec![2, 4, 6]);
}

#[tokio::test]
async fn test_weak_config_emits_no_checkpoints() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = CheckpointConfig::for_migration(MigrationType::Weak, 2);
    assert!(!config.enabled);

    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), config, tx);
    let entry = TaskLibrary::builtin().resolve("count_sequence").unwrap();
    runtime
        .clone()
        .execute(entry, count_params(6), None)
        .await
        .unwrap();

    let has_checkpoint = drain(&mut rx)
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Checkpoint(_)));
    assert!(!has_checkpoint);
    assert!(runtime.latest_checkpoint().is_none());
}

#[tokio::test]
async fn test_pause_parks_task_with_fresh_snapshot() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(10), tx);
    let entry = TaskLibrary::builtin().resolve("count_sequence").unwrap();

    let handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(
                    entry,
                    serde_json::json!({ "total": 10_000, "stepDelayMs": 2 }),
                    None,
                )
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    runtime.pause();

    let outcome = handle.await.unwrap().unwrap();
    let paused_at = match outcome {
        TaskOutcome::Paused { at } => at,
        other => panic!("expected pause, got {:?}", other),
    };
    assert!(paused_at >= 1);

    // save-on-pause snapshots exactly the step the task parked at.
    let latest = runtime.latest_checkpoint().expect("snapshot on pause");
    assert_eq!(latest.current_step, paused_at);
    assert!(latest.verify());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Paused { at, .. } if *at == paused_at)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Completed { .. })));
}

#[tokio::test]
async fn test_resume_starts_after_checkpoint_step() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task_id = TaskId::new();
    let runtime = ExecutionRuntime::new(task_id.clone(), NodeId::new(), strong_config(10), tx);
    let entry = TaskLibrary::builtin().resolve("count_sequence").unwrap();

    let mut variables = serde_json::Map::new();
    variables.insert("count".to_string(), serde_json::json!(3));
    let checkpoint = ExecutionCheckpoint::new(task_id, 3, 6, variables, NodeId::new());

    let outcome = runtime
        .execute(entry, count_params(6), Some(checkpoint))
        .await
        .unwrap();

    match outcome {
        TaskOutcome::Completed(result) => assert_eq!(result["finalCount"], 6),
        other => panic!("expected completion, got {:?}", other),
    }

    // No step below the resume point is re-executed.
    let first_step = drain(&mut rx).into_iter().find_map(|event| match event {
        RuntimeEvent::Progress(p) => Some(p.current_step),
        _ => None,
    });
    assert_eq!(first_step, Some(4));
}

#[tokio::test]
async fn test_strong_task_that_never_checkpoints_parks_bare() {
    // A task ignoring the checkpoint cadence leaves nothing to migrate; the
    // degradation is observable as an empty latest pointer after pause.
    let library = TaskLibrary::new();
    library.register("stubborn", |ctx: TaskContext| async move {
        let mut step = 0u32;
        loop {
            ctx.sleep(2).await;
            step += 1;
            ctx.report_progress(step, 1_000, None);
            if ctx.is_paused() {
                return Ok(TaskOutcome::Paused { at: step });
            }
        }
    });

    let (tx, _rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(10), tx);
    let entry = library.resolve("stubborn").unwrap();

    let handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.execute(entry, serde_json::json!({}), None).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(runtime.pause().is_none());

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, TaskOutcome::Paused { .. }));
    assert!(runtime.latest_checkpoint().is_none());
}

#[tokio::test]
async fn test_failing_task_reports_error() {
    let library = TaskLibrary::new();
    library.register("exploding", |_ctx| async move {
        Err(anyhow::anyhow!("parameters out of range"))
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(10), tx);
    let entry = library.resolve("exploding").unwrap();

    let result = runtime.execute(entry, serde_json::json!({}), None).await;
    assert!(result.is_err());

    let failed = drain(&mut rx).into_iter().find_map(|event| match event {
        RuntimeEvent::Failed { error, .. } => Some(error),
        _ => None,
    });
    assert_eq!(failed.as_deref(), Some("parameters out of range"));
}

#[tokio::test]
async fn test_prime_count_finds_expected_primes() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let runtime = ExecutionRuntime::new(TaskId::new(), NodeId::new(), strong_config(10), tx);
    let entry = TaskLibrary::builtin().resolve("prime_count").unwrap();

    let outcome = runtime
        .execute(
            entry,
            serde_json::json!({ "limit": 30, "chunkSize": 10 }),
            None,
        )
        .await
        .unwrap();

    match outcome {
        // 2, 3, 5, 7, 11, 13, 17, 19, 23, 29
        TaskOutcome::Completed(result) => assert_eq!(result["primesFound"], 10),
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn test_builtin_library_matches_manifest() {
    let library = TaskLibrary::builtin();
    for (name, _description) in BUILTIN_TASKS {
        assert!(library.has_task(name), "missing builtin {}", name);
    }
    assert!(library.resolve("eval_arbitrary_js").is_none());
}
