mod commands;
mod opts;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::snapshot::SnapshotArgs;
use opts::AgentOpts;

#[derive(Parser, Debug)]
#[command(name = "printsync", version, about = "Printer cloud sync agent")]
struct Cli {
    #[command(flatten)]
    opts: AgentOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent until Ctrl-C or SIGTERM
    Run,

    /// Check the auth token against the cloud backend
    Ping,

    /// Capture one camera frame with the configured transforms
    Snapshot(SnapshotArgs),

    /// Print the envelope the agent would send right now
    Envelope,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();
    let opts = &cli.opts;

    match cli.command {
        Command::Run => commands::run::cmd_run(opts).await,
        Command::Ping => commands::ping::cmd_ping(opts).await,
        Command::Snapshot(args) => commands::snapshot::cmd_snapshot(opts, &args).await,
        Command::Envelope => commands::envelope::cmd_envelope(opts).await,
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
