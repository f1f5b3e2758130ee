//! Worker Module
//!
//! A worker node process: probes the coordinator, opens the WebSocket
//! control channel, registers, and then multiplexes three streams in one
//! loop — inbound frames (assignments, pause commands), the heartbeat tick
//! (liveness + CPU/memory stats), and events from the embedded execution
//! runtime (progress, checkpoints, terminal states).
//!
//! A worker executes at most one task at a time; a second assignment while
//! busy is reported back as an error, never silently preempted.

pub mod service;
pub mod stats;

pub use service::WorkerService;
