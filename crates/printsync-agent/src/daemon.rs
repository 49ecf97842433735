//! Agent daemon.
//!
//! Wires the collaborators together and runs the two long-lived tasks:
//! 1. the session lifecycle (connect, receive, reply, reconnect)
//! 2. the periodic loop (job engine tick, then an envelope when the sampling
//!    interval says one is due)
//!
//! Both stop when the shutdown broadcast fires.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use printsync_protocol::{EnvelopeExtra, OutboundEnvelope};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::camera::{FrameSource, HttpSnapshotSource};
use crate::cloud::{CloudApi, HttpCloud};
use crate::cmdlog::CommandHistory;
use crate::config::{AgentConfig, SettingsHandle, SettingsWriter, settings_channel};
use crate::envelope::EnvelopeAssembler;
use crate::error::AgentError;
use crate::gateway::{MoonrakerGateway, PrinterGateway};
use crate::job::{JobConfig, JobEngine, TickOutcome};
use crate::router::Router;
use crate::sampling::{Cadence, SharedSampling};
use crate::session::{ConnectionManager, Dialer, FrameHandler, WsDialer};
use crate::stream::{HttpStreamSignaler, StreamSignaler};
use crate::system::HostSampler;
use crate::update::Updater;

const SOFTWARE: &str = "moonraker";

/// External collaborators; swapped for fakes in tests.
pub struct AgentParts {
    pub gateway: Arc<dyn PrinterGateway>,
    pub cloud: Arc<dyn CloudApi>,
    pub frames: Arc<dyn FrameSource>,
    pub signaler: Arc<dyn StreamSignaler>,
    pub dialer: Arc<dyn Dialer>,
}

pub struct Agent {
    config: AgentConfig,
    settings_writer: SettingsWriter,
    settings: SettingsHandle,
    sampling: SharedSampling,
    gateway: Arc<dyn PrinterGateway>,
    cloud: Arc<dyn CloudApi>,
    frames: Arc<dyn FrameSource>,
    assembler: Arc<EnvelopeAssembler>,
    manager: Arc<ConnectionManager>,
    router: Arc<Router>,
    updater: Arc<Updater>,
}

impl Agent {
    /// Build an agent talking to the real printer, camera and backend.
    pub fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        let config = config.expand_paths();
        let request_timeout = config.timing.http_timeout();
        let (writer, settings) = settings_channel(config.runtime_settings());

        let parts = AgentParts {
            gateway: Arc::new(MoonrakerGateway::new(&config.printer.url, request_timeout)?),
            cloud: Arc::new(HttpCloud::new(
                config.api_url()?,
                settings.clone(),
                request_timeout,
            )?),
            frames: Arc::new(HttpSnapshotSource::new(
                config.camera.snapshot_url.clone(),
                request_timeout,
            )?),
            signaler: Arc::new(HttpStreamSignaler::new(
                config.camera.webrtc_url.clone(),
                request_timeout,
            )?),
            dialer: Arc::new(WsDialer::new(config.timing.connect_timeout())),
        };
        Self::with_parts(config, writer, parts)
    }

    pub fn with_parts(
        config: AgentConfig,
        settings_writer: SettingsWriter,
        parts: AgentParts,
    ) -> Result<Self, AgentError> {
        let settings = settings_writer.handle();
        let sampling = SharedSampling::new(config.timing.sampling());

        let assembler = Arc::new(EnvelopeAssembler::new(
            parts.gateway.clone(),
            settings.clone(),
            HostSampler::new(SOFTWARE),
            config.terminal.fetch_count,
        ));
        let manager = Arc::new(
            ConnectionManager::new(
                parts.dialer,
                assembler.clone(),
                settings.clone(),
                config.session_url()?,
                config.timing.reconnect_delay(),
            )
            .with_validator(parts.cloud.clone()),
        );
        let updater = Arc::new(Updater::new(
            config.update.clone(),
            config.timing.http_timeout(),
        )?);
        let history = Arc::new(CommandHistory::new(
            config.terminal.command_log.clone(),
            config.terminal.tail_lines,
            config.terminal.fetch_count,
        ));
        let router = Arc::new(Router::new(
            settings.clone(),
            sampling.clone(),
            parts.gateway.clone(),
            parts.cloud.clone(),
            parts.signaler,
            history,
            updater.clone(),
        ));

        Ok(Self {
            config,
            settings_writer,
            settings,
            sampling,
            gateway: parts.gateway,
            cloud: parts.cloud,
            frames: parts.frames,
            assembler,
            manager,
            router,
            updater,
        })
    }

    /// The single writer for runtime settings (token, nozzle, transforms).
    pub fn settings_writer(&self) -> &SettingsWriter {
        &self.settings_writer
    }

    pub fn sampling(&self) -> &SharedSampling {
        &self.sampling
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// One envelope as it would be sent right now.
    pub async fn envelope(&self) -> OutboundEnvelope {
        self.assembler.assemble(EnvelopeExtra::default()).await
    }

    pub fn job_engine(&self) -> JobEngine {
        JobEngine::new(
            self.gateway.clone(),
            self.cloud.clone(),
            self.frames.clone(),
            self.settings.clone(),
            JobConfig {
                data_dir: self.config.storage.data_dir.clone(),
                gcode_dir: self.config.printer.gcode_dir.clone(),
                max_upload_attempts: self.config.jobs.max_upload_attempts,
            },
        )
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), AgentError> {
        info!(
            printer = %self.config.printer.url,
            cloud = %self.config.cloud.url,
            "agent starting"
        );

        let lifecycle = {
            let manager = self.manager.clone();
            let handler: Arc<dyn FrameHandler> = self.router.clone();
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move { manager.run(handler, shutdown).await })
        };

        self.updater.spawn_check();
        self.periodic(shutdown).await;

        let result = lifecycle
            .await
            .map_err(|e| AgentError::Session(format!("lifecycle task failed: {e}")))?;
        info!("agent stopped");
        result
    }

    async fn periodic(&self, mut shutdown: broadcast::Receiver<()>) {
        let tick = self.config.timing.tick();
        let mut engine = self.job_engine();
        let mut envelopes = Cadence::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(tick) => {}
            }

            let now = Instant::now();
            let capture_interval = self.sampling.capture_interval(now);
            let result = AssertUnwindSafe(engine.tick(now, capture_interval))
                .catch_unwind()
                .await;
            match result {
                Ok(outcome) => log_outcome(&outcome),
                Err(_) => {
                    error!("job tick panicked; dropping job state");
                    engine.reset().await;
                }
            }
            self.sampling.set_job_active(engine.is_active());

            if self.manager.is_connected() && envelopes.due(now, self.sampling.interval(now)) {
                let envelope = self.assembler.assemble(EnvelopeExtra::default()).await;
                self.manager.send(&envelope).await;
            }
        }
        if let Some(dir) = engine.job_dir() {
            info!(dir = %dir.display(), "stopping with a job in progress; artifacts kept");
        }
    }
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Started(name) => info!(job = %name, "job tracking started"),
        TickOutcome::Finished(name) => info!(job = %name, "job complete"),
        TickOutcome::UploadFailed { attempt } => warn!(attempt, "job upload will be retried"),
        TickOutcome::Abandoned(name) => warn!(job = %name, "job abandoned"),
        TickOutcome::Captured { row, frame } => debug!(row, frame, "captured"),
        TickOutcome::Unreachable | TickOutcome::Idle | TickOutcome::Active => {}
    }
}
