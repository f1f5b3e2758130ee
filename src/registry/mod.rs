//! Code Registry Module
//!
//! In-memory store for code bundles and execution checkpoints, owned by the
//! coordinator and injected as a dependency (no process-global state).
//!
//! ## Responsibilities
//! - **Bundles**: dual-keyed storage (generated id + human-readable name
//!   alias) with SHA-256 content checksums verified on every load.
//! - **Checkpoints**: append-only per-task history with a latest pointer;
//!   strong tasks must advance monotonically in `current_step`.
//! - **Stats**: bundle/checkpoint counts and an approximate storage size.

pub mod store;

pub use store::{CodeRegistry, RegistryError, RegistryStats};

#[cfg(test)]
mod tests;
