//! Command-line interface for agendamento-publisher.
//!
//! Provides commands for running sweeps and workers, managing the schema,
//! scheduling posts and inspecting the queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
