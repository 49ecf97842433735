//! Printer Gateway backed by Moonraker's HTTP API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use printsync_protocol::{PrinterState, Temperatures};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{FileEntry, GatewayAction, JobStatus, MotionFactors, PrinterGateway};
use crate::error::AgentError;

/// Moonraker client. Cheap to clone; pause and cancel run as background
/// requests and are reflected in [`PrinterGateway::state`] while in flight.
#[derive(Clone)]
pub struct MoonrakerGateway {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base: String,
    timeout: Duration,
    pausing: AtomicBool,
    cancelling: AtomicBool,
}

#[derive(Deserialize)]
struct Wrapped<T> {
    result: T,
}

#[derive(Deserialize)]
struct CompatPrinter {
    #[serde(default)]
    state: PrinterState,
    #[serde(default)]
    temperature: Temperatures,
}

#[derive(Deserialize)]
struct ObjectQuery<T> {
    status: T,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PrintStats {
    filename: String,
    total_duration: f64,
    print_duration: f64,
    filament_used: f64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct VirtualSdcard {
    file_path: Option<String>,
    progress: f64,
    is_active: bool,
    file_position: u64,
    file_size: u64,
}

#[derive(Deserialize)]
struct JobObjects {
    #[serde(default)]
    print_stats: PrintStats,
    #[serde(default)]
    virtual_sdcard: VirtualSdcard,
}

#[derive(Deserialize)]
struct GcodeMove {
    extrude_factor: f64,
    speed_factor: f64,
    #[serde(default)]
    homing_origin: Vec<f64>,
}

#[derive(Deserialize)]
struct MoveObjects {
    gcode_move: GcodeMove,
}

#[derive(Deserialize)]
struct GcodeStore {
    gcode_store: Vec<GcodeStoreEntry>,
}

#[derive(Deserialize)]
struct GcodeStoreEntry {
    message: String,
}

#[derive(Deserialize)]
struct ListedFile {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    modified: f64,
}

#[derive(Deserialize)]
struct PrinterInfo {
    software_version: String,
}

#[derive(Deserialize)]
struct FileMetadata {
    #[serde(default)]
    estimated_time: Option<f64>,
}

impl MoonrakerGateway {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base: base_url.trim_end_matches('/').to_owned(),
                timeout: request_timeout,
                pausing: AtomicBool::new(false),
                cancelling: AtomicBool::new(false),
            }),
        })
    }
}

impl Inner {
    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base, endpoint)
    }

    async fn execute(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AgentError> {
        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| AgentError::Timeout(format!("printer request {endpoint}")))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: format!("printer {endpoint}"),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, AgentError> {
        let request = self.client.get(self.url(endpoint));
        let response = self.execute(endpoint, request).await?;
        Ok(response.json::<T>().await?)
    }

    async fn post_json(&self, endpoint: &str, body: serde_json::Value) -> Result<(), AgentError> {
        let request = self.client.post(self.url(endpoint)).json(&body);
        self.execute(endpoint, request).await?;
        Ok(())
    }

    async fn script(&self, script: &str) -> Result<(), AgentError> {
        info!(script, "sending gcode");
        self.post_json("/printer/gcode/script", json!({ "script": script }))
            .await
    }

    async fn compat_printer(&self) -> Result<CompatPrinter, AgentError> {
        self.get("/api/printer").await
    }
}

#[async_trait]
impl PrinterGateway for MoonrakerGateway {
    async fn state(&self) -> Result<PrinterState, AgentError> {
        let mut state = self.inner.compat_printer().await?.state;
        if self.inner.cancelling.load(Ordering::SeqCst) {
            state.text = "Cancelling".into();
            state.flags.cancelling = true;
        }
        if self.inner.pausing.load(Ordering::SeqCst) {
            state.text = "Pausing".into();
            state.flags.pausing = true;
        }
        Ok(state)
    }

    async fn temperatures(&self) -> Result<Temperatures, AgentError> {
        Ok(self.inner.compat_printer().await?.temperature)
    }

    async fn job_status(&self) -> Result<JobStatus, AgentError> {
        let objects: Wrapped<ObjectQuery<JobObjects>> = self
            .inner
            .get("/printer/objects/query?print_stats&virtual_sdcard")
            .await?;
        let JobObjects {
            print_stats,
            virtual_sdcard,
        } = objects.result.status;
        Ok(JobStatus {
            filename: print_stats.filename,
            file_path: virtual_sdcard.file_path,
            progress: virtual_sdcard.progress,
            print_duration: print_stats.print_duration,
            total_duration: print_stats.total_duration,
            filament_used: print_stats.filament_used,
            file_position: virtual_sdcard.file_position,
            file_size: virtual_sdcard.file_size,
            is_active: virtual_sdcard.is_active,
        })
    }

    async fn motion_factors(&self) -> Result<MotionFactors, AgentError> {
        let objects: Wrapped<ObjectQuery<MoveObjects>> = self
            .inner
            .get("/printer/objects/query?gcode_move")
            .await?;
        let gcode_move = objects.result.status.gcode_move;
        Ok(MotionFactors {
            flow_rate: gcode_move.extrude_factor,
            feed_rate: gcode_move.speed_factor,
            z_offset: gcode_move.homing_origin.get(2).copied().unwrap_or_default(),
        })
    }

    async fn recent_commands(&self, count: usize) -> Result<Vec<String>, AgentError> {
        let store: Wrapped<GcodeStore> = self
            .inner
            .get(&format!("/server/gcode_store?count={count}"))
            .await?;
        Ok(store
            .result
            .gcode_store
            .into_iter()
            .map(|entry| entry.message)
            .collect())
    }

    async fn file_tree(&self) -> Result<Vec<FileEntry>, AgentError> {
        let files: Wrapped<Vec<ListedFile>> =
            self.inner.get("/server/files/list?root=gcodes").await?;
        Ok(files
            .result
            .into_iter()
            .map(|f| FileEntry {
                path: f.path,
                size: f.size,
                modified: f.modified,
            })
            .collect())
    }

    async fn firmware_version(&self) -> Result<String, AgentError> {
        let info: Wrapped<PrinterInfo> = self.inner.get("/printer/info").await?;
        Ok(info.result.software_version)
    }

    async fn estimated_print_time(&self, filename: &str) -> Result<f64, AgentError> {
        let request = self
            .inner
            .client
            .get(self.inner.url("/server/files/metadata"))
            .query(&[("filename", filename)]);
        let response = self
            .inner
            .execute("/server/files/metadata", request)
            .await?;
        let meta: Wrapped<FileMetadata> = response.json().await?;
        Ok(meta.result.estimated_time.unwrap_or_default())
    }

    async fn send_action(&self, action: GatewayAction) -> Result<(), AgentError> {
        if let Some(script) = action.script() {
            return self.inner.script(&script).await;
        }
        match action {
            GatewayAction::Pause => {
                let inner = self.inner.clone();
                inner.pausing.store(true, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(err) = inner.post_json("/printer/print/pause", json!({})).await {
                        warn!(error = %err, "pause request failed");
                    }
                    inner.pausing.store(false, Ordering::SeqCst);
                });
                Ok(())
            }
            GatewayAction::Cancel => {
                let inner = self.inner.clone();
                inner.cancelling.store(true, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(err) = inner.post_json("/printer/print/cancel", json!({})).await {
                        warn!(error = %err, "cancel request failed");
                    }
                    inner.cancelling.store(false, Ordering::SeqCst);
                    if let Err(err) = inner.script("SDCARD_RESET_FILE").await {
                        warn!(error = %err, "clearing print stats failed");
                    }
                });
                Ok(())
            }
            GatewayAction::Resume => {
                self.inner
                    .post_json("/printer/print/resume", json!({}))
                    .await
            }
            GatewayAction::StartPrint { filename } => {
                self.inner
                    .post_json("/printer/print/start", json!({ "filename": filename }))
                    .await
            }
            GatewayAction::UploadFile { filename, content } => {
                let size = content.len();
                let part = Part::bytes(content).file_name(filename.clone());
                let form = Form::new().part("file", part);
                let request = self
                    .inner
                    .client
                    .post(self.inner.url("/server/files/upload"))
                    .multipart(form);
                self.inner.execute("/server/files/upload", request).await?;
                info!(%filename, size, "uploaded file to printer");
                Ok(())
            }
            GatewayAction::DeleteFile { filename } => {
                let endpoint = format!("/server/files/gcodes/{filename}");
                let request = self.inner.client.delete(self.inner.url(&endpoint));
                self.inner.execute(&endpoint, request).await?;
                Ok(())
            }
            GatewayAction::CreateFolder { path } => {
                self.inner
                    .post_json(
                        "/server/files/directory",
                        json!({ "path": format!("gcodes/{}", path.trim_start_matches('/')) }),
                    )
                    .await
            }
            other => Err(AgentError::Printer(format!(
                "action has no controller mapping: {other:?}"
            ))),
        }
    }
}
