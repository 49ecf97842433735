//! `printsync ping` command.

use anyhow::Result;
use printsync_agent::{CloudApi, HttpCloud, TokenStatus, settings_channel};

use crate::opts::AgentOpts;

pub async fn cmd_ping(opts: &AgentOpts) -> Result<()> {
    let config = opts.load_config()?;
    let (_writer, settings) = settings_channel(config.runtime_settings());
    let cloud = HttpCloud::new(config.api_url()?, settings, config.timing.http_timeout())?;

    let status = cloud.ping(&config.cloud.auth_token).await;
    println!("{}", status.message());
    if status != TokenStatus::Valid {
        anyhow::bail!("token check failed");
    }
    Ok(())
}
