//! `printsync snapshot` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use printsync_agent::camera::{FrameSource, HttpSnapshotSource, transform_frame};

use crate::opts::AgentOpts;

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Output PNG path
    #[arg(long, short = 'o', default_value = "snapshot.png")]
    pub out: PathBuf,
}

pub async fn cmd_snapshot(opts: &AgentOpts, args: &SnapshotArgs) -> Result<()> {
    let config = opts.load_config()?;
    let source =
        HttpSnapshotSource::new(config.camera.snapshot_url.clone(), config.timing.http_timeout())?;

    let raw = source.capture().await.context("capture frame")?;
    let png = transform_frame(raw, config.runtime_settings().transforms).await?;
    tokio::fs::write(&args.out, &png)
        .await
        .with_context(|| format!("write {}", args.out.display()))?;
    println!("{} ({} bytes)", args.out.display(), png.len());
    Ok(())
}
