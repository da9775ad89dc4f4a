//! Task data model shared by the orchestrator, the lifecycle manager and the
//! in-VM agent.
//!
//! A [`TaskConfig`] is created once by the orchestrator, injected into the VM
//! as JSON, and read-only from then on. Every run ends in exactly one
//! [`TaskOutcome`], carried on the progress channel's closing event.

pub mod config;
pub mod outcome;

pub use config::{TaskConfig, TaskConfigError};
pub use outcome::{ErrorKind, TaskOutcome, TerminalStatus};
