//! CLI module
//!
//! Argument definitions for the `command-server` binary.

pub mod args;

pub use args::{Cli, Mode};
