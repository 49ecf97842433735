//! `printsync run` command.

use anyhow::{Context, Result};
use printsync_agent::Agent;
use tokio::sync::broadcast;

use crate::opts::AgentOpts;

pub async fn cmd_run(opts: &AgentOpts) -> Result<()> {
    let config = opts.load_config()?;
    let agent = Agent::from_config(config).context("build agent")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx.send(());
    });

    agent.run(shutdown_rx).await?;
    Ok(())
}
