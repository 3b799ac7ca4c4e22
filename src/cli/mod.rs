//! Command-line interface for ratelimit-manager.
//!
//! Provides commands for running the control loop, loading wallet events,
//! inspecting the queues and hosting a worker unit.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
