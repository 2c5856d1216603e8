//! Command-line interface for solver-lab.
//!
//! Provides the `run` command, which drives an experiment pipeline over a
//! corpus of instances, and `steps`, which lists the pipeline.

mod commands;

pub use commands::{parse_cli, register_default_steps, run, run_with_cli, Cli, Commands, RunArgs};
