//! Command server and discovery client
//!
//! A command server owns one directory and one child process. Clients in
//! that directory, or anywhere below it, find the server through the
//! registry and ask it to re-run its command.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   resolve(cwd)   ┌──────────────┐
//! │ DiscoveryClient  │ ───────────────→ │   Registry   │
//! └────────┬─────────┘                  └──────▲───────┘
//!          │ Invoke                            │ publish / withdraw
//!          ↓          Unix socket       ┌──────┴───────┐
//!          └──────────────────────────→ │ CommandServer│
//!                                       └──────┬───────┘
//!                                              │ respawn (FIFO)
//!                                       ┌──────↓───────┐
//!                                       │ managed child│
//!                                       └──────────────┘
//! ```
//!
//! # Usage
//!
//! Start a server in the project root:
//! ```bash
//! command-server cargo run
//! ```
//!
//! Re-run it from anywhere inside the project:
//! ```bash
//! command-server --invoke
//! ```

mod client;
mod daemon;
pub mod protocol;
pub mod transport;

pub use client::{DiscoveryClient, InvokeOutcome};
pub use daemon::{shutdown_signal, CommandServer, RunningServer, DEFAULT_QUEUE_CAPACITY};
pub use protocol::{ServerRequest, ServerResponse, ServerStatus};
pub use transport::{Transport, UnixTransport};
