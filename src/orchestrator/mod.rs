//! Application-level orchestration.
//!
//! This module owns the run lifecycle (workspace reset, import, launch,
//! automation, monitoring) and emits events for the host. CLI code calls into
//! this module to keep responsibilities separated.

pub mod controller;
pub mod mailbox;
pub mod monitor;
pub mod retry;
pub mod workspace;

pub use controller::{spawn_run, Pipeline, RunRequest, EVENT_CHANNEL_CAPACITY};
