//! Execution Runtime Module
//!
//! Worker-embedded cooperative task executor.
//!
//! ## Architecture Overview
//! A task runs as one async function driven by the worker. It cooperates with
//! the runtime through a [`TaskContext`]:
//! 1. **Progress**: `report_progress` advances the runtime counters and feeds
//!    the coordinator's observer stream.
//! 2. **Checkpoints**: `should_checkpoint` fires every `interval_steps`
//!    progress reports; `save_checkpoint` snapshots the step counter plus an
//!    opaque variable map and forwards it upstream.
//! 3. **Pause**: `pause()` raises a flag; the task must check `is_paused`
//!    after each unit of work and end cleanly with a paused marker.
//! 4. **Resume**: an assignment carrying a checkpoint restarts the task at
//!    `checkpoint.current_step + 1` with its variables restored.
//!
//! ## Submodules
//! - **`executor`**: the runtime itself (counters, pause flag, event stream).
//! - **`library`**: fixed library of built-in tasks addressable by bundle
//!   name; dynamic code evaluation is refused.

pub mod executor;
pub mod library;

pub use executor::{CheckpointConfig, ExecutionRuntime, RuntimeEvent, TaskContext, TaskOutcome};
pub use library::{TaskFn, TaskLibrary, BUILTIN_TASKS};

#[cfg(test)]
mod tests;
