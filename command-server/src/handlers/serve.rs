//! Server mode: `command-server <argv...>`

use anyhow::{Context, Result};

use super::HandlerContext;
use crate::server::{shutdown_signal, CommandServer};

/// Run `command` for the current directory until SIGINT, SIGTERM or `--stop`
pub async fn run_serve(ctx: &HandlerContext, command: Vec<String>) -> Result<()> {
    let server = CommandServer::new(
        ctx.working_directory(),
        command,
        ctx.supervisor(),
        ctx.registry(),
    )?
    .with_queue_capacity(ctx.config().server.queue_capacity);

    let directory = server.directory().to_path_buf();
    let running = match server.start().await {
        Ok(running) => running,
        Err(e) if e.is_already_registered() => {
            return Err(e).context("Stop the running server first (command-server --stop)");
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to start server in {}", directory.display()))
        }
    };

    tracing::info!(
        "Serving {} on {} (Ctrl+C to stop)",
        directory.display(),
        running.endpoint().display()
    );
    running.serve(shutdown_signal()).await?;
    Ok(())
}
