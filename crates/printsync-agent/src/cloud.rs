//! REST calls to the cloud backend: token checks and job artifact uploads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use crate::config::SettingsHandle;
use crate::error::AgentError;

/// Outcome of validating an auth token against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Missing,
    Valid,
    Invalid,
    Unreachable,
    Unexpected(u16),
}

impl TokenStatus {
    /// Statuses that make a connection attempt pointless until the token changes.
    pub fn blocks_connect(&self) -> bool {
        matches!(self, TokenStatus::Missing | TokenStatus::Invalid)
    }

    /// User-facing status line.
    pub fn message(&self) -> String {
        match self {
            TokenStatus::Missing => "Please enter a token.".into(),
            TokenStatus::Valid => "Token is valid.".into(),
            TokenStatus::Invalid => "Token is invalid; enter a new one to reconnect.".into(),
            TokenStatus::Unreachable => {
                "Could not reach the cloud service; will keep retrying.".into()
            }
            TokenStatus::Unexpected(status) => {
                format!("Unexpected response from the cloud service (HTTP {status}).")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStartMeta {
    pub name: String,
    pub long_name: String,
    pub gcode_file: String,
    pub start_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEndMeta {
    pub name: String,
    pub long_name: String,
    pub csv_file: String,
    pub gcode_file: String,
    pub start_time: String,
    pub end_time: String,
}

/// Per-frame metadata sent alongside each captured image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMeta {
    pub name: String,
    pub img_file: String,
    pub count: u64,
    pub timestamp: String,
    pub flow_rate: f64,
    pub feed_rate: f64,
    pub z_offset: f64,
    pub hotend_target: f64,
    pub hotend_actual: f64,
    pub bed_target: f64,
    pub bed_actual: f64,
    pub nozzle_tip_coords_x: i64,
    pub nozzle_tip_coords_y: i64,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate: bool,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn ping(&self, token: &str) -> TokenStatus;
    async fn upload_job_start(&self, meta: &JobStartMeta, gcode: &Path) -> Result<(), AgentError>;
    async fn upload_job_end(
        &self,
        meta: &JobEndMeta,
        csv: &Path,
        gcode: Option<&Path>,
    ) -> Result<(), AgentError>;
    async fn upload_frame(&self, meta: &FrameMeta, png: Vec<u8>) -> Result<(), AgentError>;
    /// Download a G-code file staged on the backend.
    async fn fetch_staged_file(&self, bucket_file: &str) -> Result<Vec<u8>, AgentError>;
}

pub struct HttpCloud {
    client: Client,
    api: Url,
    settings: SettingsHandle,
    timeout: Duration,
}

impl HttpCloud {
    pub fn new(api: Url, settings: SettingsHandle, request_timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api,
            settings,
            timeout: request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AgentError> {
        self.api
            .join(path)
            .map_err(|e| AgentError::Config(format!("invalid endpoint {path}: {e}")))
    }

    async fn post_form(&self, path: &str, form: Form) -> Result<(), AgentError> {
        let url = self.endpoint(path)?;
        let token = self.settings.current().auth_token.clone();
        let request = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, token)
            .multipart(form);
        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| AgentError::Timeout(format!("cloud {path}")))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: format!("cloud {path}"),
                status: status.as_u16(),
            });
        }
        debug!(path, status = status.as_u16(), "cloud upload accepted");
        Ok(())
    }
}

async fn file_part(path: &Path, mime: &str) -> Result<Part, AgentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AgentError::io(path, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Part::bytes(bytes).file_name(name).mime_str(mime)?)
}

#[async_trait]
impl CloudApi for HttpCloud {
    async fn ping(&self, token: &str) -> TokenStatus {
        if token.is_empty() {
            return TokenStatus::Missing;
        }
        let Ok(url) = self.endpoint("printers/ping") else {
            return TokenStatus::Unreachable;
        };
        let request = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send();
        match timeout(self.timeout, request).await {
            Ok(Ok(response)) => match response.status().as_u16() {
                200 => TokenStatus::Valid,
                401 => TokenStatus::Invalid,
                other => TokenStatus::Unexpected(other),
            },
            Ok(Err(_)) | Err(_) => TokenStatus::Unreachable,
        }
    }

    async fn upload_job_start(&self, meta: &JobStartMeta, gcode: &Path) -> Result<(), AgentError> {
        let form = Form::new()
            .text("data", serde_json::to_string(meta)?)
            .part("gcode_obj", file_part(gcode, "text/plain").await?);
        self.post_form("print-jobs/remote/start-job", form).await?;
        info!(job = %meta.long_name, "uploaded job start");
        Ok(())
    }

    async fn upload_job_end(
        &self,
        meta: &JobEndMeta,
        csv: &Path,
        gcode: Option<&Path>,
    ) -> Result<(), AgentError> {
        let mut form = Form::new()
            .text("data", serde_json::to_string(meta)?)
            .part("csv_obj", file_part(csv, "text/csv").await?);
        if let Some(gcode) = gcode {
            form = form.part("gcode_obj", file_part(gcode, "text/plain").await?);
        }
        self.post_form("print-jobs/remote/end-job", form).await?;
        info!(job = %meta.long_name, "uploaded finished job");
        Ok(())
    }

    async fn upload_frame(&self, meta: &FrameMeta, png: Vec<u8>) -> Result<(), AgentError> {
        let part = Part::bytes(png)
            .file_name(meta.img_file.clone())
            .mime_str("image/png")?;
        let form = Form::new()
            .text("data", serde_json::to_string(meta)?)
            .part("image_obj", part);
        self.post_form("images/print/predict/new-image", form).await
    }

    async fn fetch_staged_file(&self, bucket_file: &str) -> Result<Vec<u8>, AgentError> {
        let path = "print-jobs/printer/gcode/uploadfile";
        let url = self.endpoint(path)?;
        let token = self.settings.current().auth_token.clone();
        let request = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, token)
            .form(&[("bucket_file", bucket_file)]);
        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| AgentError::Timeout(format!("cloud {path}")))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: format!("cloud {path}"),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
