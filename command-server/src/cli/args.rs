//! CLI argument definitions

use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(name = "command-server")]
#[command(about = "Run a command for a directory and re-run it on request from anywhere below")]
#[command(version)]
pub struct Cli {
    /// Ask the nearest server above the current directory to re-run its command
    #[arg(long, conflicts_with_all = ["status", "stop"])]
    pub invoke: bool,

    /// Show the nearest server's state
    #[arg(long, conflicts_with = "stop")]
    pub status: bool,

    /// Stop the nearest server
    #[arg(long)]
    pub stop: bool,

    /// Registry directory (default: from .command-server.toml or the runtime dir)
    #[arg(long, env = "COMMAND_SERVER_REGISTRY", global = true)]
    pub registry_dir: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Command to serve, e.g. `command-server cargo run`
    #[arg(
        trailing_var_arg = true,
        value_name = "COMMAND",
        required_unless_present_any = ["invoke", "status", "stop"],
        conflicts_with_all = ["invoke", "status", "stop"]
    )]
    pub command: Vec<String>,
}

/// What this invocation of the binary does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve(Vec<String>),
    Invoke,
    Status,
    Stop,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.invoke {
            Mode::Invoke
        } else if self.status {
            Mode::Status
        } else if self.stop {
            Mode::Stop
        } else {
            Mode::Serve(self.command.clone())
        }
    }
}
