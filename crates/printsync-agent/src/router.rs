//! Message Router: turns validated inbound frames into side effects and the
//! extra fields of the reply envelope.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use printsync_protocol::{
    EnvelopeExtra, ExecuteCommand, FilesCommand, GcodeCommand, InboundFrame, MotionCommand,
    PrinterCommand, StreamSignal, TemperatureCommand, parse_frame,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cloud::CloudApi;
use crate::cmdlog::{CommandHistory, cherry_pick};
use crate::config::SettingsHandle;
use crate::error::AgentError;
use crate::gateway::{GatewayAction, Heater, PrinterGateway};
use crate::sampling::SharedSampling;
use crate::session::FrameHandler;
use crate::stream::{StreamSignaler, failure_message};
use crate::update::Updater;

pub struct Router {
    settings: SettingsHandle,
    sampling: SharedSampling,
    gateway: Arc<dyn PrinterGateway>,
    cloud: Arc<dyn CloudApi>,
    signaler: Arc<dyn StreamSignaler>,
    history: Arc<CommandHistory>,
    updater: Arc<Updater>,
    /// Auth key of the last stream request that was forwarded.
    last_stream_key: Mutex<Option<String>>,
}

impl Router {
    pub fn new(
        settings: SettingsHandle,
        sampling: SharedSampling,
        gateway: Arc<dyn PrinterGateway>,
        cloud: Arc<dyn CloudApi>,
        signaler: Arc<dyn StreamSignaler>,
        history: Arc<CommandHistory>,
        updater: Arc<Updater>,
    ) -> Self {
        Self {
            settings,
            sampling,
            gateway,
            cloud,
            signaler,
            history,
            updater,
            last_stream_key: Mutex::new(None),
        }
    }

    /// Apply one parsed frame and return the reply's extra fields.
    pub async fn route(&self, frame: InboundFrame) -> EnvelopeExtra {
        match frame {
            InboundFrame::Presence(presence) => {
                debug!(online = presence.is_online(), "presence update");
                self.sampling.set_user_online(presence.is_online());
                EnvelopeExtra::default()
            }
            InboundFrame::Stream {
                signal,
                payload,
                auth_key,
            } => self.stream(signal, payload, auth_key).await,
            InboundFrame::StatusQuery => self.status().await,
            InboundFrame::UpdateRequest => {
                if !self.updater.spawn_check() {
                    debug!("update check already running");
                }
                EnvelopeExtra::default()
            }
            InboundFrame::Command(command) => {
                if let Err(err) = self.dispatch(command).await {
                    warn!(error = %err, "printer command failed");
                }
                EnvelopeExtra::default()
            }
        }
    }

    async fn stream(
        &self,
        signal: StreamSignal,
        payload: Value,
        auth_key: Option<String>,
    ) -> EnvelopeExtra {
        self.sampling.mark_stream_request(Instant::now());

        if signal == StreamSignal::Request {
            let mut last = self
                .last_stream_key
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match &auth_key {
                Some(key) if last.as_deref() != Some(key.as_str()) => {
                    *last = Some(key.clone());
                }
                _ => {
                    debug!("stream request without a new auth key");
                    return EnvelopeExtra::default();
                }
            }
        }

        let transforms = Some(self.settings.current().transforms);
        match self.signaler.signal(signal, &payload).await {
            Ok(mut answer) => {
                if let (Some(key), Value::Object(map)) = (&auth_key, &mut answer) {
                    map.insert("auth_key".into(), Value::String(key.clone()));
                }
                EnvelopeExtra {
                    webrtc_data: Some(answer),
                    transforms,
                    ..EnvelopeExtra::default()
                }
            }
            Err(err) => {
                warn!(signal = signal.as_str(), error = %err, "stream signalling failed");
                EnvelopeExtra {
                    webrtc_error: Some(failure_message(signal).to_owned()),
                    transforms,
                    ..EnvelopeExtra::default()
                }
            }
        }
    }

    async fn status(&self) -> EnvelopeExtra {
        match self.history.unseen(self.gateway.as_ref()).await {
            Ok(fresh) => {
                let picked = cherry_pick(&fresh, &self.settings.current().cherry_pick);
                EnvelopeExtra::terminal_commands(picked)
            }
            Err(err) => {
                warn!(error = %err, "terminal command reconciliation failed");
                EnvelopeExtra::default()
            }
        }
    }

    async fn dispatch(&self, command: PrinterCommand) -> Result<(), AgentError> {
        let action = match command {
            PrinterCommand::Motion(motion) => match motion {
                MotionCommand::Home { axes } => GatewayAction::Home { axes },
                MotionCommand::Move { axes } => GatewayAction::Jog { axes },
                MotionCommand::Extrude { value } | MotionCommand::Retract { value } => {
                    GatewayAction::Extrude { amount: value }
                }
            },
            PrinterCommand::Temperature(TemperatureCommand::Temperature { heater, value }) => {
                let Some(heater) = Heater::from_name(&heater) else {
                    debug!(%heater, "unknown heater");
                    return Ok(());
                };
                GatewayAction::SetTemperature { heater, value }
            }
            PrinterCommand::Execute(execute) => match execute {
                ExecuteCommand::Pause => GatewayAction::Pause,
                ExecuteCommand::Resume => GatewayAction::Resume,
                ExecuteCommand::Cancel => GatewayAction::Cancel,
                ExecuteCommand::Reset => GatewayAction::ClearPrintStats,
                ExecuteCommand::Toggle => {
                    let state = self.gateway.state().await?;
                    if state.flags.printing {
                        GatewayAction::Pause
                    } else if state.flags.paused {
                        GatewayAction::Resume
                    } else {
                        debug!(state = %state.text, "nothing to toggle");
                        return Ok(());
                    }
                }
            },
            PrinterCommand::Files(files) => match files {
                FilesCommand::Print { file } => GatewayAction::StartPrint { filename: file },
                FilesCommand::Select { file } => {
                    info!(%file, "file selected");
                    return Ok(());
                }
                FilesCommand::Upload { file, content } => {
                    let content = BASE64
                        .decode(content.trim())
                        .map_err(|e| AgentError::Printer(format!("upload {file}: {e}")))?;
                    GatewayAction::UploadFile {
                        filename: file,
                        content,
                    }
                }
                FilesCommand::UploadBig { file, content } => {
                    let content = self.cloud.fetch_staged_file(&content).await?;
                    GatewayAction::UploadFile {
                        filename: file,
                        content,
                    }
                }
                FilesCommand::Delete { file } => GatewayAction::DeleteFile { filename: file },
                FilesCommand::NewFolder { folder } => GatewayAction::CreateFolder { path: folder },
            },
            PrinterCommand::Gcode(GcodeCommand::Send { lines }) => GatewayAction::Gcode {
                script: lines.script(),
            },
            PrinterCommand::Unknown { domain, reason } => {
                debug!(?domain, %reason, "ignoring unknown command");
                return Ok(());
            }
        };
        debug!(action = action.name(), "dispatching printer action");
        self.gateway.send_action(action).await
    }
}

#[async_trait]
impl FrameHandler for Router {
    async fn handle_frame(&self, raw: &str) -> Option<EnvelopeExtra> {
        let token = self.settings.current().auth_token.clone();
        match parse_frame(raw, &token) {
            Ok(frame) => Some(self.route(frame).await),
            Err(err) => {
                debug!(error = %err, "dropping inbound frame");
                None
            }
        }
    }

    fn after_reply(&self) {
        let interval = self.sampling.interval(Instant::now());
        debug!(interval_ms = interval.as_millis() as u64, "sampling interval");
    }
}
