//! In-memory stand-ins for the agent's collaborators, for tests and dry runs.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as wire;
use futures::{SinkExt, StreamExt};
use image::{ImageFormat, Rgb, RgbImage};
use printsync_protocol::{
    EnvelopeExtra, FileListing, HeaterReading, OutboundEnvelope, PACKET_KIND, PrinterState,
    StateFlags, StreamSignal, SystemInfo, Temperatures,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use crate::camera::FrameSource;
use crate::cloud::{CloudApi, FrameMeta, JobEndMeta, JobStartMeta, TokenStatus};
use crate::config::SettingsHandle;
use crate::envelope::EnvelopeSource;
use crate::error::AgentError;
use crate::gateway::{FileEntry, GatewayAction, JobStatus, MotionFactors, PrinterGateway};
use crate::session::{Dialer, Incoming, WireSink, WireStream};
use crate::stream::StreamSignaler;
use crate::util::timestamp_now;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct FakePrinter {
    reachable: bool,
    state: PrinterState,
    temperatures: Temperatures,
    job: JobStatus,
    motion: MotionFactors,
    commands: Vec<String>,
    files: Vec<FileEntry>,
    firmware: String,
    estimate: f64,
}

impl Default for FakePrinter {
    fn default() -> Self {
        let mut heaters = BTreeMap::new();
        heaters.insert(
            "tool0".to_owned(),
            HeaterReading {
                actual: 24.0,
                target: 0.0,
                offset: 0.0,
            },
        );
        heaters.insert(
            "bed".to_owned(),
            HeaterReading {
                actual: 22.0,
                target: 0.0,
                offset: 0.0,
            },
        );
        Self {
            reachable: true,
            state: idle_state(),
            temperatures: Temperatures(heaters),
            job: JobStatus::default(),
            motion: MotionFactors::default(),
            commands: Vec::new(),
            files: Vec::new(),
            firmware: "v0.12.0".into(),
            estimate: 0.0,
        }
    }
}

fn idle_state() -> PrinterState {
    PrinterState {
        text: "Operational".into(),
        flags: StateFlags {
            operational: true,
            ready: true,
            ..StateFlags::default()
        },
    }
}

/// Scriptable printer controller.
#[derive(Default)]
pub struct FakeGateway {
    printer: Mutex<FakePrinter>,
    actions: Mutex<Vec<GatewayAction>>,
    panicking: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a running print of `filename`, stored at `file_path` on disk.
    pub fn set_printing(&self, filename: &str, file_path: &Path) {
        let size = std::fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
        let mut printer = lock(&self.printer);
        printer.state = PrinterState {
            text: "Printing".into(),
            flags: StateFlags {
                operational: true,
                printing: true,
                ..StateFlags::default()
            },
        };
        printer.job = JobStatus {
            filename: filename.to_owned(),
            file_path: Some(file_path.to_string_lossy().into_owned()),
            file_size: size,
            is_active: true,
            ..JobStatus::default()
        };
    }

    pub fn set_paused(&self) {
        let mut printer = lock(&self.printer);
        printer.state = PrinterState {
            text: "Paused".into(),
            flags: StateFlags {
                operational: true,
                paused: true,
                ..StateFlags::default()
            },
        };
    }

    /// Report an operational printer with no job.
    pub fn set_idle(&self) {
        let mut printer = lock(&self.printer);
        printer.state = idle_state();
        printer.job.is_active = false;
    }

    /// Make state reads panic, as a controller client bug would.
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.printer).reachable = !unreachable;
    }

    pub fn set_progress(&self, position: u64, progress: f64, print_duration: f64) {
        let mut printer = lock(&self.printer);
        printer.job.file_position = position;
        printer.job.progress = progress;
        printer.job.print_duration = print_duration;
    }

    pub fn set_commands(&self, commands: &[&str]) {
        lock(&self.printer).commands = commands.iter().map(|c| (*c).to_owned()).collect();
    }

    pub fn set_files(&self, files: Vec<FileEntry>) {
        lock(&self.printer).files = files;
    }

    pub fn set_estimate(&self, seconds: f64) {
        lock(&self.printer).estimate = seconds;
    }

    /// Actions received so far, oldest first.
    pub fn actions(&self) -> Vec<GatewayAction> {
        lock(&self.actions).clone()
    }

    fn snapshot(&self) -> Result<FakePrinter, AgentError> {
        let printer = lock(&self.printer);
        if printer.reachable {
            Ok(printer.clone())
        } else {
            Err(AgentError::Timeout("fake printer unreachable".into()))
        }
    }
}

#[async_trait]
impl PrinterGateway for FakeGateway {
    async fn state(&self) -> Result<PrinterState, AgentError> {
        if self.panicking.load(Ordering::SeqCst) {
            panic!("fake printer state read panicked");
        }
        Ok(self.snapshot()?.state)
    }

    async fn temperatures(&self) -> Result<Temperatures, AgentError> {
        Ok(self.snapshot()?.temperatures)
    }

    async fn job_status(&self) -> Result<JobStatus, AgentError> {
        Ok(self.snapshot()?.job)
    }

    async fn motion_factors(&self) -> Result<MotionFactors, AgentError> {
        Ok(self.snapshot()?.motion)
    }

    async fn recent_commands(&self, count: usize) -> Result<Vec<String>, AgentError> {
        let commands = self.snapshot()?.commands;
        let skip = commands.len().saturating_sub(count);
        Ok(commands.into_iter().skip(skip).collect())
    }

    async fn file_tree(&self) -> Result<Vec<FileEntry>, AgentError> {
        Ok(self.snapshot()?.files)
    }

    async fn firmware_version(&self) -> Result<String, AgentError> {
        Ok(self.snapshot()?.firmware)
    }

    async fn estimated_print_time(&self, _filename: &str) -> Result<f64, AgentError> {
        Ok(self.snapshot()?.estimate)
    }

    async fn send_action(&self, action: GatewayAction) -> Result<(), AgentError> {
        self.snapshot()?;
        lock(&self.actions).push(action);
        Ok(())
    }
}

/// Cloud backend that records every call.
pub struct RecordingCloud {
    ping_status: Mutex<TokenStatus>,
    pings: AtomicUsize,
    /// Remaining end-job uploads to fail; `u32::MAX` fails forever.
    end_failures: AtomicU32,
    starts: Mutex<Vec<JobStartMeta>>,
    ends: Mutex<Vec<JobEndMeta>>,
    end_attempts: AtomicUsize,
    frames: Mutex<Vec<FrameMeta>>,
    staged: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Default for RecordingCloud {
    fn default() -> Self {
        Self {
            ping_status: Mutex::new(TokenStatus::Valid),
            pings: AtomicUsize::new(0),
            end_failures: AtomicU32::new(0),
            starts: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
            end_attempts: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
            staged: Mutex::new(BTreeMap::new()),
        }
    }
}

impl RecordingCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ping_status(&self, status: TokenStatus) {
        *lock(&self.ping_status) = status;
    }

    pub fn fail_end_uploads(&self, count: u32) {
        self.end_failures.store(count, Ordering::SeqCst);
    }

    pub fn stage_file(&self, bucket_file: &str, content: &[u8]) {
        lock(&self.staged).insert(bucket_file.to_owned(), content.to_vec());
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn job_starts(&self) -> Vec<JobStartMeta> {
        lock(&self.starts).clone()
    }

    /// Successful end-job uploads.
    pub fn job_ends(&self) -> Vec<JobEndMeta> {
        lock(&self.ends).clone()
    }

    /// End-job uploads attempted, failed or not.
    pub fn end_attempts(&self) -> usize {
        self.end_attempts.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<FrameMeta> {
        lock(&self.frames).clone()
    }
}

#[async_trait]
impl CloudApi for RecordingCloud {
    async fn ping(&self, token: &str) -> TokenStatus {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if token.is_empty() {
            return TokenStatus::Missing;
        }
        lock(&self.ping_status).clone()
    }

    async fn upload_job_start(&self, meta: &JobStartMeta, gcode: &Path) -> Result<(), AgentError> {
        tokio::fs::metadata(gcode)
            .await
            .map_err(|e| AgentError::io(gcode, e))?;
        lock(&self.starts).push(meta.clone());
        Ok(())
    }

    async fn upload_job_end(
        &self,
        meta: &JobEndMeta,
        csv: &Path,
        _gcode: Option<&Path>,
    ) -> Result<(), AgentError> {
        self.end_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.end_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.end_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(AgentError::Status {
                context: "fake end-job".into(),
                status: 503,
            });
        }
        tokio::fs::metadata(csv)
            .await
            .map_err(|e| AgentError::io(csv, e))?;
        lock(&self.ends).push(meta.clone());
        Ok(())
    }

    async fn upload_frame(&self, meta: &FrameMeta, png: Vec<u8>) -> Result<(), AgentError> {
        image::load_from_memory_with_format(&png, ImageFormat::Png)?;
        lock(&self.frames).push(meta.clone());
        Ok(())
    }

    async fn fetch_staged_file(&self, bucket_file: &str) -> Result<Vec<u8>, AgentError> {
        lock(&self.staged)
            .get(bucket_file)
            .cloned()
            .ok_or_else(|| AgentError::Status {
                context: format!("staged file {bucket_file}"),
                status: 404,
            })
    }
}

/// Camera that always returns the same small image.
#[derive(Default)]
pub struct StaticFrames {
    failing: AtomicBool,
    captures: AtomicUsize,
}

impl StaticFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for StaticFrames {
    async fn capture(&self) -> Result<Vec<u8>, AgentError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Timeout("fake camera offline".into()));
        }
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Stream signaller that answers every step, or fails on demand.
#[derive(Default)]
pub struct EchoSignaler {
    failing: AtomicBool,
    calls: Mutex<Vec<(StreamSignal, Value)>>,
}

impl EchoSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(StreamSignal, Value)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StreamSignaler for EchoSignaler {
    async fn signal(&self, signal: StreamSignal, payload: &Value) -> Result<Value, AgentError> {
        lock(&self.calls).push((signal, payload.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Timeout("fake streamer offline".into()));
        }
        Ok(json!({ "type": "answer", "signal": signal.as_str() }))
    }
}

/// Envelope source that skips the printer entirely.
pub struct StaticEnvelopes {
    settings: SettingsHandle,
}

impl StaticEnvelopes {
    pub fn new(settings: SettingsHandle) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EnvelopeSource for StaticEnvelopes {
    async fn envelope(&self, extra: EnvelopeExtra) -> OutboundEnvelope {
        let settings = self.settings.current();
        OutboundEnvelope {
            kind: PACKET_KIND.to_owned(),
            token: settings.auth_token.clone(),
            timestamp: timestamp_now(),
            files: FileListing::default(),
            terminal_cmds: Vec::new(),
            system: SystemInfo::default(),
            nozzle_tip_coords: settings.nozzle_tip,
            webcam_transforms: settings.transforms,
            printer: None,
            extra,
        }
    }
}

/// The far side of one [`ChannelDialer`] connection.
pub struct Peer {
    pub url: Url,
    from_agent: wire::UnboundedReceiver<String>,
    to_agent: wire::UnboundedSender<Result<Incoming, AgentError>>,
}

impl Peer {
    /// Next text frame sent by the agent, if any arrives within `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.from_agent.next())
            .await
            .ok()
            .flatten()
    }

    /// Next frame sent by the agent, parsed as JSON.
    pub async fn recv_json(&mut self, wait: Duration) -> Option<Value> {
        let text = self.recv(wait).await?;
        serde_json::from_str(&text).ok()
    }

    pub async fn send(&mut self, text: impl Into<String>) -> bool {
        self.to_agent.send(Ok(Incoming::Text(text.into()))).await.is_ok()
    }

    /// Stop accepting frames from the agent without closing the connection,
    /// so its sends fail while its receive side stays open.
    pub fn stop_reading(&mut self) {
        self.from_agent.close();
    }

    /// Close politely with a close frame.
    pub async fn close(mut self) {
        let _ = self.to_agent.send(Ok(Incoming::Close)).await;
    }

    /// Tear the connection down with a transport error.
    pub async fn fail(mut self, reason: &str) {
        let _ = self
            .to_agent
            .send(Err(AgentError::Session(reason.to_owned())))
            .await;
    }
}

/// In-memory duplex transport; each successful dial yields a [`Peer`].
pub struct ChannelDialer {
    peers_tx: mpsc::UnboundedSender<Peer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Peer>>,
    refuse: AtomicU32,
    dials: AtomicUsize,
}

impl Default for ChannelDialer {
    fn default() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
            refuse: AtomicU32::new(0),
            dials: AtomicUsize::new(0),
        }
    }
}

impl ChannelDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `count` dials.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Wait for the agent's next connection.
    pub async fn accept(&self, wait: Duration) -> Option<Peer> {
        let mut peers = self.peers_rx.lock().await;
        tokio::time::timeout(wait, peers.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl Dialer for ChannelDialer {
    async fn dial(&self, url: &Url) -> Result<(WireSink, WireStream), AgentError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AgentError::Session("connection refused".into()));
        }

        let (agent_tx, from_agent) = wire::unbounded::<String>();
        let (to_agent, agent_rx) = wire::unbounded::<Result<Incoming, AgentError>>();
        let peer = Peer {
            url: url.clone(),
            from_agent,
            to_agent,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| AgentError::Session("dialer closed".into()))?;
        let sink = agent_tx.sink_map_err(|e| AgentError::Session(format!("peer gone: {e}")));
        Ok((Box::pin(sink), Box::pin(agent_rx)))
    }
}
