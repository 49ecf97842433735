//! `printsync envelope` command.

use anyhow::{Context, Result};
use printsync_agent::Agent;

use crate::opts::AgentOpts;

pub async fn cmd_envelope(opts: &AgentOpts) -> Result<()> {
    let config = opts.load_config()?;
    let agent = Agent::from_config(config).context("build agent")?;
    let envelope = agent.envelope().await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
