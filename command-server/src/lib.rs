//! Directory-scoped command server
//!
//! `command-server <argv...>` runs a command for the current directory.
//! `command-server --invoke` from that directory or any descendant asks the
//! nearest server to terminate and re-run it.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod supervisor;
