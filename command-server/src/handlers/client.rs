//! Client modes: `--invoke`, `--status`, `--stop`
//!
//! Each handler writes its user-facing line(s) to `out` and returns
//! whether the command succeeded; `main` turns that into the exit code.

use std::io::Write;

use anyhow::Result;

use super::HandlerContext;
use crate::server::InvokeOutcome;

const NO_SERVER: &str = "no server registered";

/// Handle `--invoke`
pub async fn run_invoke(ctx: &HandlerContext, out: &mut impl Write) -> Result<bool> {
    let outcome = ctx.client().invoke(ctx.working_directory()).await;
    if let InvokeOutcome::ConnectionError(detail) = &outcome {
        tracing::info!("Connection error: {}", detail);
    }
    writeln!(out, "{}", outcome)?;
    Ok(outcome.is_ok())
}

/// Handle `--status`
pub async fn run_status(ctx: &HandlerContext, out: &mut impl Write) -> Result<bool> {
    let Some(status) = ctx.client().status(ctx.working_directory()).await? else {
        writeln!(out, "{}", NO_SERVER)?;
        return Ok(false);
    };

    writeln!(out, "Directory:   {}", status.directory.display())?;
    writeln!(out, "Endpoint:    {}", status.endpoint.display())?;
    writeln!(out, "Server PID:  {}", status.pid)?;
    writeln!(out, "Command:     {}", status.command.join(" "))?;
    match (status.child_pid, status.child) {
        (Some(pid), Some(state)) => writeln!(out, "Child:       {} ({})", pid, state)?,
        (None, Some(state)) => writeln!(out, "Child:       {}", state)?,
        (_, None) => writeln!(out, "Child:       restarting")?,
    }
    writeln!(out, "Invocations: {}", status.invocations)?;
    writeln!(out, "Uptime:      {}s", status.uptime_secs)?;
    Ok(true)
}

/// Handle `--stop`
pub async fn run_stop(ctx: &HandlerContext, out: &mut impl Write) -> Result<bool> {
    match ctx.client().stop(ctx.working_directory()).await? {
        Some(registration) => {
            writeln!(
                out,
                "Stopping server for {}",
                registration.canonical_directory.display()
            )?;
            Ok(true)
        }
        None => {
            writeln!(out, "{}", NO_SERVER)?;
            Ok(false)
        }
    }
}
