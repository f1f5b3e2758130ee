//! Coordinator Module
//!
//! The singular authority of the cluster. Owns the node table, the task
//! table, and every migration transaction; all worker-visible state
//! transitions pass through it.
//!
//! ## Architecture Overview
//! 1. **Control channel**: each node/observer holds one WebSocket; frames are
//!    `{event, payload}` JSON envelopes dispatched by `handle_envelope`.
//! 2. **Single lock**: the node/task/stats/waiter maps form one
//!    `ClusterState` behind one mutex — migration invariants cross maps, so
//!    finer-grained locking is deliberately not used.
//! 3. **Migration transaction**: `PREPARE -> AWAIT_SNAPSHOT -> COMMIT`,
//!    with the snapshot wait modeled as a per-task oneshot raced against a
//!    hard timeout; aborts leave the task recoverable.
//! 4. **Monitors**: a periodic sweep evicts nodes that stop heartbeating,
//!    and a per-node CPU window fires strong auto-migrations away from
//!    sustained overload.
//!
//! ## Submodules
//! - **`service`**: authority state, message dispatch, assignment, recovery
//!   application.
//! - **`migration`**: the transactional handoff and its abort paths.
//! - **`monitor`**: failure sweep + overload detector.
//! - **`server`**: axum `/health` + `/ws` surface.

pub mod migration;
pub mod monitor;
pub mod server;
pub mod service;

pub use migration::MigrationError;
pub use service::{ClusterState, ConnectionCtx, Coordinator};
