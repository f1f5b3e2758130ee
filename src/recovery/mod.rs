//! Recovery Module
//!
//! Rebinds tasks orphaned by a node failure. Weak tasks restart from scratch
//! on a new worker; strong tasks resume from the latest checkpoint in the
//! registry, falling back to a logged restart when none exists. Planning is
//! pure — the coordinator applies the resulting actions under its own lock.

pub mod manager;

pub use manager::{RecoveryAction, RecoveryManager};

#[cfg(test)]
mod tests;
