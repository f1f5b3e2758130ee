use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::executor::{TaskContext, TaskOutcome};

pub type TaskFn = Arc<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>>
        + Send
        + Sync,
>;

/// Names and descriptions of the built-in tasks. The coordinator seeds a
/// code bundle for each entry at startup so submissions can address them by
/// name.
pub const BUILTIN_TASKS: &[(&str, &str)] = &[
    (
        "count_sequence",
        "Counts from 1 to a configurable total, one delayed step at a time",
    ),
    (
        "prime_count",
        "Counts primes below a configurable limit in fixed-size chunks",
    ),
];

/// Fixed library of executable tasks, keyed by bundle name.
///
/// Dynamic code evaluation is refused: a bundle whose name has no library
/// entry fails execution with a task error.
pub struct TaskLibrary {
    entries: DashMap<String, TaskFn>,
}

impl TaskLibrary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    /// Library with every built-in task registered.
    pub fn builtin() -> Arc<Self> {
        let library = Self::new();
        library.register("count_sequence", count_sequence);
        library.register("prime_count", prime_count);
        library
    }

    pub fn register<F, Fut>(&self, name: &str, entry: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
    {
        let entry_fn: TaskFn = Arc::new(move |context: TaskContext| {
            Box::pin(entry(context)) as Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>>
        });
        self.entries.insert(name.to_string(), entry_fn);
        tracing::debug!("Registered library task: {}", name);
    }

    pub fn resolve(&self, name: &str) -> Option<TaskFn> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Counts 1..=total with a per-step delay.
///
/// Params: `total` (default 100), `stepDelayMs` (default 50).
/// Variables: `count` — the running tally restored on resume.
fn count_sequence(
    ctx: TaskContext,
) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>> {
    Box::pin(async move {
        let total = ctx.params["total"].as_u64().unwrap_or(100) as u32;
        let delay_ms = ctx.params["stepDelayMs"].as_u64().unwrap_or(50);

        let mut count: u64 = 0;
        let mut start = 1u32;
        if let Some(checkpoint) = &ctx.checkpoint {
            start = checkpoint.current_step + 1;
            count = checkpoint
                .variables
                .get("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(checkpoint.current_step as u64);
        }

        for step in start..=total {
            ctx.sleep(delay_ms).await;
            count += 1;
            ctx.report_progress(step, total, None);

            if ctx.should_checkpoint() {
                ctx.save_checkpoint(step, count_variables(count));
            }

            if ctx.is_paused() {
                if ctx.should_snapshot_on_pause() {
                    ctx.save_checkpoint(step, count_variables(count));
                }
                return Ok(TaskOutcome::Paused { at: step });
            }
        }

        Ok(TaskOutcome::Completed(
            serde_json::json!({ "finalCount": count }),
        ))
    })
}

fn count_variables(count: u64) -> serde_json::Map<String, serde_json::Value> {
    let mut variables = serde_json::Map::new();
    variables.insert("count".to_string(), serde_json::json!(count));
    variables
}

/// Counts primes below `limit` in chunks of `chunkSize` numbers per step.
///
/// Params: `limit` (default 1000), `chunkSize` (default 100).
/// Variables: `found` — primes counted so far.
fn prime_count(ctx: TaskContext) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>> {
    Box::pin(async move {
        let limit = ctx.params["limit"].as_u64().unwrap_or(1000);
        let chunk_size = ctx.params["chunkSize"].as_u64().unwrap_or(100).max(1);
        let total_steps = (limit.div_ceil(chunk_size)) as u32;

        let mut found: u64 = 0;
        let mut start = 1u32;
        if let Some(checkpoint) = &ctx.checkpoint {
            start = checkpoint.current_step + 1;
            found = checkpoint
                .variables
                .get("found")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
        }

        for step in start..=total_steps {
            let lower = (step as u64 - 1) * chunk_size;
            let upper = (lower + chunk_size).min(limit);
            for n in lower..upper {
                if is_prime(n) {
                    found += 1;
                }
            }

            // Yield between chunks so the pause flag is observed promptly.
            ctx.sleep(1).await;
            ctx.report_progress(step, total_steps, Some(format!("{} primes so far", found)));

            if ctx.should_checkpoint() {
                ctx.save_checkpoint(step, prime_variables(found));
            }

            if ctx.is_paused() {
                if ctx.should_snapshot_on_pause() {
                    ctx.save_checkpoint(step, prime_variables(found));
                }
                return Ok(TaskOutcome::Paused { at: step });
            }
        }

        Ok(TaskOutcome::Completed(
            serde_json::json!({ "primesFound": found, "limit": limit }),
        ))
    })
}

fn prime_variables(found: u64) -> serde_json::Map<String, serde_json::Value> {
    let mut variables = serde_json::Map::new();
    variables.insert("found".to_string(), serde_json::json!(found));
    variables
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}
