//! Agent configuration.
//!
//! Static settings come from a TOML file (every section optional). The few
//! values that may change while the agent runs are split out into
//! [`RuntimeSettings`] and published through a watch channel, so there is
//! exactly one writer ([`SettingsWriter`]) and any number of readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use printsync_protocol::{NozzleTip, WebcamTransforms};
use serde::Deserialize;
use tokio::sync::watch;
use url::Url;

use crate::error::AgentError;
use crate::sampling::SamplingPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub cloud: CloudConfig,
    pub printer: PrinterConfig,
    pub camera: CameraConfig,
    pub nozzle: NozzleConfig,
    pub terminal: TerminalConfig,
    pub storage: StorageConfig,
    pub timing: TimingConfig,
    pub jobs: JobsConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// REST base URL of the backend, e.g. `https://cloud.example.com/`.
    pub url: String,
    pub auth_token: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/".into(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Moonraker base URL.
    pub url: String,
    pub gcode_dir: PathBuf,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7125".into(),
            gcode_dir: PathBuf::from("~/printer_data/gcodes"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub snapshot_url: String,
    pub webrtc_url: String,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            snapshot_url: "http://localhost/webcam/snapshot".into(),
            webrtc_url: "http://localhost/webcam/webrtc".into(),
            flip_h: false,
            flip_v: false,
            rotate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct NozzleConfig {
    pub x: i64,
    pub y: i64,
}

impl Default for NozzleConfig {
    fn default() -> Self {
        let tip = NozzleTip::default();
        Self { x: tip.x, y: tip.y }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Append-only echo log of commands already reported to the backend.
    pub command_log: PathBuf,
    pub tail_lines: usize,
    pub fetch_count: usize,
    /// Substrings selecting which unseen commands are reported. Empty keeps all.
    pub cherry_pick: Vec<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command_log: PathBuf::from("~/.printsync/logs/cmd.log"),
            tail_lines: 50,
            fetch_count: 50,
            cherry_pick: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory holding one artifact directory per job.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.printsync/jobs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_ms: u64,
    pub fast_ms: u64,
    pub idle_ms: u64,
    pub stream_ms: u64,
    pub stream_window_ms: u64,
    pub reconnect_delay_ms: u64,
    pub http_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            fast_ms: 1250,
            idle_ms: 30_000,
            stream_ms: 2500,
            stream_window_ms: 15_000,
            reconnect_delay_ms: 3000,
            http_timeout_ms: 5000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sampling(&self) -> SamplingPolicy {
        SamplingPolicy {
            fast: Duration::from_millis(self.fast_ms),
            idle: Duration::from_millis(self.idle_ms),
            streaming: Duration::from_millis(self.stream_ms),
            stream_window: Duration::from_millis(self.stream_window_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Failed finished-job uploads tolerated before artifacts are discarded.
    pub max_upload_attempts: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_upload_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Endpoint returning the latest release as JSON with a `tag_name` field.
    pub releases_url: Option<String>,
    /// Command (argv) run when a newer release is found.
    pub command: Vec<String>,
    /// The command is killed when it runs longer than this.
    pub command_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            releases_url: None,
            command: Vec::new(),
            command_timeout_secs: 600,
        }
    }
}

impl UpdateConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl AgentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, AgentError> {
        toml::from_str(text).map_err(|e| AgentError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Expand `~` in every configured path.
    pub fn expand_paths(mut self) -> Self {
        self.printer.gcode_dir = expand_home(&self.printer.gcode_dir);
        self.terminal.command_log = expand_home(&self.terminal.command_log);
        self.storage.data_dir = expand_home(&self.storage.data_dir);
        self
    }

    /// REST base for backend calls (`<cloud url>/api/v1/`).
    pub fn api_url(&self) -> Result<Url, AgentError> {
        let mut base = self.cloud.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|u| u.join("api/v1/"))
            .map_err(|e| AgentError::Config(format!("invalid cloud url {:?}: {e}", self.cloud.url)))
    }

    /// Duplex endpoint derived from the REST base by swapping the scheme.
    pub fn session_url(&self) -> Result<Url, AgentError> {
        let mut url = self
            .api_url()?
            .join("ws/printer")
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(AgentError::Config(format!(
                    "unsupported cloud url scheme {other:?}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::Config("cannot derive session url".into()))?;
        Ok(url)
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            auth_token: self.cloud.auth_token.clone(),
            nozzle_tip: NozzleTip {
                x: self.nozzle.x,
                y: self.nozzle.y,
            },
            transforms: WebcamTransforms {
                flip_h: self.camera.flip_h,
                flip_v: self.camera.flip_v,
                rotate: self.camera.rotate,
            },
            cherry_pick: self.terminal.cherry_pick.clone(),
        }
    }
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Settings that can change while the agent runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSettings {
    pub auth_token: String,
    pub nozzle_tip: NozzleTip,
    pub transforms: WebcamTransforms,
    pub cherry_pick: Vec<String>,
}

pub fn settings_channel(initial: RuntimeSettings) -> (SettingsWriter, SettingsHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (SettingsWriter(tx), SettingsHandle(rx))
}

/// The single writer for [`RuntimeSettings`].
#[derive(Debug)]
pub struct SettingsWriter(watch::Sender<Arc<RuntimeSettings>>);

impl SettingsWriter {
    pub fn update(&self, f: impl FnOnce(&mut RuntimeSettings)) {
        self.0.send_modify(|current| f(Arc::make_mut(current)));
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.update(|s| s.auth_token = token);
    }

    pub fn handle(&self) -> SettingsHandle {
        SettingsHandle(self.0.subscribe())
    }
}

#[derive(Debug, Clone)]
pub struct SettingsHandle(watch::Receiver<Arc<RuntimeSettings>>);

impl SettingsHandle {
    pub fn current(&self) -> Arc<RuntimeSettings> {
        self.0.borrow().clone()
    }

    /// Wait for the writer to publish a change. Errors once the writer is gone.
    pub async fn changed(&mut self) -> Result<Arc<RuntimeSettings>, AgentError> {
        self.0
            .changed()
            .await
            .map_err(|_| AgentError::Config("settings writer dropped".into()))?;
        Ok(self.0.borrow_and_update().clone())
    }
}
