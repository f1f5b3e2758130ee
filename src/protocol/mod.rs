//! Control-Channel Protocol
//!
//! Defines the wire contract shared by the coordinator, workers, and observers:
//! the closed set of event names, the `{event, payload}` envelope, the payload
//! DTOs, and the cluster data model (nodes, tasks, code bundles, checkpoints).
//!
//! Every message on the control channel is a JSON `Envelope`. Payload structs
//! serialize with camelCase field names; both the event names and the field
//! names are part of the external contract and must stay bit-stable.

pub mod events;
pub mod types;
