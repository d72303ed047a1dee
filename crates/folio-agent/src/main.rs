//! The folio-agent binary: hosts evaluation contexts for a workspace and
//! speaks the agent protocol over stdio.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use folio_agent::server::{AgentOptions, AgentServer};

#[derive(Parser)]
#[command(
    name = "folio-agent",
    about = "Target-process evaluation agent for folio workbooks"
)]
struct Args {
    /// Tracing filter, e.g. "info" or "folio_agent=debug".
    #[arg(long, default_value = "info")]
    log: String,

    /// Disable stdout/stderr capture during evaluation.
    #[arg(long)]
    no_capture: bool,

    /// Directory for materialized module images. Defaults to a
    /// process-scoped directory under the system temp dir.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let scratch_dir = args.scratch_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("folio-agent-{}", std::process::id()))
    });

    let options = AgentOptions {
        scratch_dir,
        capture_output: !args.no_capture,
    };

    tracing::info!(pid = std::process::id(), "folio-agent starting");

    #[cfg(unix)]
    {
        // Reserve the stdio descriptors for the protocol before any
        // evaluation can redirect fd 1/2.
        let (stdin, stdout) = folio_agent::output::take_protocol_stdio()
            .context("failed to reserve protocol stdio")?;
        AgentServer::run(stdin, stdout, options)?;
    }

    #[cfg(not(unix))]
    {
        AgentServer::run(std::io::stdin(), std::io::stdout(), options)?;
    }

    tracing::info!("folio-agent exiting");
    Ok(())
}
