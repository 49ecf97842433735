//! Out-of-band self-update check.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::UpdateConfig;
use crate::error::AgentError;
use crate::system::AGENT_VERSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// No release endpoint configured.
    Disabled,
    /// Another check is already running.
    Busy,
    UpToDate,
    /// A different release exists but no update command is configured.
    Available(String),
    Installed(String),
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

fn normalize(version: &str) -> &str {
    let version = version.trim();
    version.strip_prefix('v').unwrap_or(version)
}

/// Whether the published tag names a different version than `current`.
pub fn differs_from(latest_tag: &str, current: &str) -> bool {
    let latest = normalize(latest_tag);
    !latest.is_empty() && latest != normalize(current)
}

pub struct Updater {
    client: Client,
    config: UpdateConfig,
    timeout: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Updater {
    pub fn new(config: UpdateConfig, request_timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("printsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            timeout: request_timeout,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run [`Updater::check`] in the background. Returns `false` when a check
    /// is already in flight.
    pub fn spawn_check(self: &Arc<Self>) -> bool {
        if self.is_running() {
            return false;
        }
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            match updater.check().await {
                Ok(UpdateCheck::Available(version)) => {
                    info!(%version, "update available, no update command configured")
                }
                Ok(UpdateCheck::Installed(version)) => info!(%version, "update installed"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "update check failed"),
            }
        });
        true
    }

    pub async fn check(&self) -> Result<UpdateCheck, AgentError> {
        let Some(url) = self.config.releases_url.as_deref() else {
            return Ok(UpdateCheck::Disabled);
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(UpdateCheck::Busy);
        }
        let _guard = RunningGuard(&self.running);

        let response = timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| AgentError::Timeout("release lookup".into()))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: "release lookup".into(),
                status: status.as_u16(),
            });
        }
        let release: Release = response.json().await?;
        if !differs_from(&release.tag_name, AGENT_VERSION) {
            info!(version = AGENT_VERSION, "agent is up to date");
            return Ok(UpdateCheck::UpToDate);
        }

        let latest = normalize(&release.tag_name).to_owned();
        let Some((program, args)) = self.config.command.split_first() else {
            return Ok(UpdateCheck::Available(latest));
        };
        info!(from = AGENT_VERSION, to = %latest, "running update command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.config.command_timeout(), child)
            .await
            .map_err(|_| AgentError::Timeout(format!("update command {program}")))?
            .map_err(|e| AgentError::io(program, e))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(target: "update", "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!(target: "update", "{line}");
        }
        if !output.status.success() {
            return Err(AgentError::Config(format!(
                "update command exited with {}",
                output.status
            )));
        }
        Ok(UpdateCheck::Installed(latest))
    }
}
