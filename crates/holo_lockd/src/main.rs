// holo-lockd binary entry point.
//
// Parses the CLI, installs logging, starts the lock server and runs until
// interrupted.

use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use holo_lockd::{start_server, ServerArgs};

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = ServerArgs::parse();
    let server = start_server(&args)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("wait for ctrl-c")?;

    tracing::info!("shutting down lock server");
    server.shutdown()
}
