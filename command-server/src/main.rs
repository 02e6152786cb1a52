use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use command_server::cli::{Cli, Mode};
use command_server::handlers::{self, HandlerContext};

/// Initialize tracing with verbosity level
///
/// Verbosity levels:
/// - 0: warn (default)
/// - 1: info (-v)
/// - 2: debug (-vv)
/// - 3+: trace (-vvv)
///
/// Logs go to stderr; stdout belongs to the managed command and to client
/// results. Set `LOG_FORMAT=json` for structured output.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Allow RUST_LOG to override if set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry_dir = cli.registry_dir.as_deref();
    let mut stdout = std::io::stdout();

    let succeeded = match cli.mode() {
        Mode::Serve(command) => {
            let ctx = HandlerContext::load(registry_dir)?;
            handlers::run_serve(&ctx, command).await?;
            true
        }
        Mode::Invoke => {
            let ctx = HandlerContext::load_for_client(registry_dir)?;
            handlers::run_invoke(&ctx, &mut stdout).await?
        }
        Mode::Status => {
            let ctx = HandlerContext::load_for_client(registry_dir)?;
            handlers::run_status(&ctx, &mut stdout).await?
        }
        Mode::Stop => {
            let ctx = HandlerContext::load_for_client(registry_dir)?;
            handlers::run_stop(&ctx, &mut stdout).await?
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
