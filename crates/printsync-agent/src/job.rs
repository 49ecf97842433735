//! Job Lifecycle Engine.
//!
//! Tracks one print from the moment the controller reports a job until its
//! artifacts have been uploaded (or given up on). The engine is owned by the
//! periodic task; nothing else touches an active job.
//!
//! ```text
//! Idle --has_job--> Active --operational, no job--> Finishing --upload ok--> Idle
//!                                                      |  ^
//!                                                      +--+ upload failed, attempts left
//! ```
//!
//! A print that starts and is cancelled between two polls is never seen as
//! Active and produces no artifacts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use printsync_protocol::Temperatures;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::camera::{FrameSource, transform_frame};
use crate::cloud::{CloudApi, FrameMeta, JobEndMeta, JobStartMeta};
use crate::config::SettingsHandle;
use crate::error::AgentError;
use crate::gateway::{MotionFactors, PrinterGateway};
use crate::gcode::GcodeCursor;
use crate::sampling::Cadence;
use crate::util::timestamp_now;

pub const LOG_FILE: &str = "print_log.csv";

pub const LOG_HEADER: [&str; 17] = [
    "count",
    "timestamp",
    "flow_rate",
    "feed_rate",
    "z_offset",
    "target_hotend",
    "hotend",
    "target_bed",
    "bed",
    "gcode_line_num_no_comments",
    "gcode_cmd",
    "file_position_bytes",
    "nozzle_tip_coords_x",
    "nozzle_tip_coords_y",
    "flip_h",
    "flip_v",
    "rotate",
];

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Base directory for per-job artifact directories.
    pub data_dir: PathBuf,
    /// Where the controller keeps its G-code files.
    pub gcode_dir: PathBuf,
    pub max_upload_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Active,
    Finishing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The printer state could not be read; nothing changed.
    Unreachable,
    Idle,
    Started(String),
    Captured { row: bool, frame: bool },
    /// Job running, not yet time for the next capture.
    Active,
    Finished(String),
    UploadFailed { attempt: u32 },
    /// Upload budget exhausted; artifacts were discarded.
    Abandoned(String),
}

/// One line of the telemetry log, in column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct TelemetryRow {
    count: u64,
    timestamp: String,
    flow_rate: f64,
    feed_rate: f64,
    z_offset: f64,
    target_hotend: f64,
    hotend: f64,
    target_bed: f64,
    bed: f64,
    line_number: u64,
    command: String,
    file_position: u64,
    nozzle_x: i64,
    nozzle_y: i64,
    flip_h: bool,
    flip_v: bool,
    rotate: bool,
}

struct TelemetryLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TelemetryLog {
    fn create(path: PathBuf) -> Result<Self, AgentError> {
        let file = File::create(&path).map_err(|e| AgentError::io(&path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(LOG_HEADER)?;
        writer.flush().map_err(|e| AgentError::io(&path, e))?;
        Ok(Self { path, writer })
    }

    fn append(&mut self, row: &TelemetryRow) -> Result<(), AgentError> {
        self.writer.serialize(row)?;
        self.writer
            .flush()
            .map_err(|e| AgentError::io(&self.path, e))
    }

    fn close(mut self) -> Result<(), AgentError> {
        self.writer
            .flush()
            .map_err(|e| AgentError::io(&self.path, e))
    }
}

/// Readings shared by a telemetry row and the frame captured with it.
#[derive(Debug, Clone, Copy)]
struct Readings {
    motion: MotionFactors,
    hotend: (f64, f64),
    bed: (f64, f64),
}

impl Readings {
    fn new(motion: MotionFactors, temps: &Temperatures) -> Self {
        let hotend = temps.hotend();
        let bed = temps.bed();
        Self {
            motion,
            hotend: (hotend.target, hotend.actual),
            bed: (bed.target, bed.actual),
        }
    }
}

struct JobRecord {
    /// Stem of the G-code file name.
    name: String,
    /// `{name}_{start timestamp}`; unique per job.
    long_name: String,
    dir: PathBuf,
    gcode: Option<PathBuf>,
    cursor: Option<GcodeCursor>,
    log: Option<TelemetryLog>,
    csv_path: PathBuf,
    frames: u64,
    upload_attempts: u32,
    start_time: String,
    end_time: Option<String>,
    /// Last readings that were fetched successfully.
    baseline: Readings,
}

impl JobRecord {
    /// File name of the G-code snapshot, if one was taken.
    fn gcode_file(&self) -> String {
        self.gcode
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    async fn close_log(&mut self) {
        self.cursor = None;
        let Some(log) = self.log.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || log.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(job = %self.long_name, error = %err, "failed to close telemetry log")
            }
            Err(err) => warn!(job = %self.long_name, error = %err, "telemetry task failed"),
        }
    }
}

/// Open the G-code cursor and the telemetry log off the async executor.
async fn open_artifacts(
    gcode: Option<PathBuf>,
    csv_path: PathBuf,
) -> (Option<GcodeCursor>, Option<TelemetryLog>) {
    let opened = tokio::task::spawn_blocking(move || {
        let cursor = match gcode.as_deref().map(GcodeCursor::open) {
            Some(Ok(cursor)) => Some(cursor),
            Some(Err(err)) => {
                warn!(error = %err, "failed to open G-code snapshot");
                None
            }
            None => None,
        };
        let log = match TelemetryLog::create(csv_path) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(error = %err, "failed to create telemetry log");
                None
            }
        };
        (cursor, log)
    })
    .await;
    opened.unwrap_or_else(|err| {
        warn!(error = %err, "artifact setup task failed");
        (None, None)
    })
}

/// Resolve the line under `row.file_position` and append the row.
fn write_row(
    log: &mut TelemetryLog,
    cursor: Option<&mut GcodeCursor>,
    mut row: TelemetryRow,
) -> Result<(), AgentError> {
    if let Some(cursor) = cursor {
        let line = cursor.locate(row.file_position)?;
        row.line_number = line.line_number;
        row.command = line.command;
    }
    log.append(&row)
}

enum Phase {
    Idle,
    Active(JobRecord),
    Finishing(JobRecord),
}

/// Collaborators shared by every phase.
struct JobContext {
    gateway: Arc<dyn PrinterGateway>,
    cloud: Arc<dyn CloudApi>,
    frames: Arc<dyn FrameSource>,
    settings: SettingsHandle,
    config: JobConfig,
}

/// Owns at most one job. The job stays in `phase` while a tick awaits, so a
/// tick that never completes leaves it for [`JobEngine::reset`] to clean up.
pub struct JobEngine {
    ctx: JobContext,
    phase: Phase,
    cadence: Cadence,
}

impl JobEngine {
    pub fn new(
        gateway: Arc<dyn PrinterGateway>,
        cloud: Arc<dyn CloudApi>,
        frames: Arc<dyn FrameSource>,
        settings: SettingsHandle,
        config: JobConfig,
    ) -> Self {
        Self {
            ctx: JobContext {
                gateway,
                cloud,
                frames,
                settings,
                config,
            },
            phase: Phase::Idle,
            cadence: Cadence::new(),
        }
    }

    pub fn state(&self) -> JobState {
        match self.phase {
            Phase::Idle => JobState::Idle,
            Phase::Active(_) => JobState::Active,
            Phase::Finishing(_) => JobState::Finishing,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Artifact directory of the current job, if any.
    pub fn job_dir(&self) -> Option<&Path> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Active(job) | Phase::Finishing(job) => Some(&job.dir),
        }
    }

    /// Drop the current job and its artifacts. A no-op when idle.
    pub async fn reset(&mut self) {
        if let Phase::Active(job) | Phase::Finishing(job) = &self.phase {
            info!(job = %job.long_name, "discarding job");
        }
        self.discard().await;
    }

    /// Advance the state machine by one poll.
    pub async fn tick(&mut self, now: Instant, capture_interval: Duration) -> TickOutcome {
        match self.phase {
            Phase::Idle => self.tick_idle().await,
            Phase::Active(_) => self.tick_active(now, capture_interval).await,
            Phase::Finishing(_) => self.finish().await,
        }
    }

    async fn tick_idle(&mut self) -> TickOutcome {
        let state = match self.ctx.gateway.state().await {
            Ok(state) => state,
            Err(err) => {
                debug!(error = %err, "printer state unavailable");
                return TickOutcome::Unreachable;
            }
        };
        if !state.has_job() {
            return TickOutcome::Idle;
        }
        let job = match self.ctx.open_job().await {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "failed to start job tracking");
                return TickOutcome::Idle;
            }
        };
        let name = job.long_name.clone();
        self.cadence.reset();
        self.phase = Phase::Active(job);
        if let Phase::Active(job) = &mut self.phase {
            self.ctx.announce(job).await;
        }
        TickOutcome::Started(name)
    }

    async fn tick_active(&mut self, now: Instant, capture_interval: Duration) -> TickOutcome {
        let Phase::Active(job) = &mut self.phase else {
            return TickOutcome::Idle;
        };
        let state = match self.ctx.gateway.state().await {
            Ok(state) => state,
            Err(err) => {
                debug!(job = %job.long_name, error = %err, "printer state unavailable");
                return TickOutcome::Unreachable;
            }
        };

        if state.has_job() {
            return if self.cadence.due(now, capture_interval) {
                self.ctx.capture(job).await
            } else {
                TickOutcome::Active
            };
        }

        if !state.is_operational() {
            // error or transitional state; wait for a clear idle report
            return TickOutcome::Active;
        }

        info!(job = %job.long_name, frames = job.frames, "print finished");
        job.end_time = Some(timestamp_now());
        job.close_log().await;
        if let Phase::Active(job) = std::mem::replace(&mut self.phase, Phase::Idle) {
            self.phase = Phase::Finishing(job);
        }
        self.finish().await
    }

    async fn finish(&mut self) -> TickOutcome {
        let Phase::Finishing(job) = &mut self.phase else {
            return TickOutcome::Idle;
        };
        match self.ctx.upload_finished(job).await {
            Ok(()) => {
                info!(job = %job.long_name, "job artifacts uploaded");
                let name = job.long_name.clone();
                self.discard().await;
                TickOutcome::Finished(name)
            }
            Err(err) => {
                job.upload_attempts += 1;
                let attempt = job.upload_attempts;
                warn!(job = %job.long_name, attempt, error = %err, "job upload failed");
                if attempt < self.ctx.config.max_upload_attempts.max(1) {
                    return TickOutcome::UploadFailed { attempt };
                }
                warn!(job = %job.long_name, "upload attempts exhausted, discarding artifacts");
                let name = job.long_name.clone();
                self.discard().await;
                TickOutcome::Abandoned(name)
            }
        }
    }

    /// Clear the current job and remove its artifact directory.
    async fn discard(&mut self) {
        let mut job = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return,
            Phase::Active(job) | Phase::Finishing(job) => job,
        };
        job.close_log().await;
        self.cadence.reset();
        match tokio::fs::remove_dir_all(&job.dir).await {
            Ok(()) => debug!(dir = %job.dir.display(), "removed job directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(dir = %job.dir.display(), error = %err, "failed to remove job directory")
            }
        }
    }
}

impl JobContext {
    /// Create the artifact directory, snapshot the G-code and open the log.
    async fn open_job(&self) -> Result<JobRecord, AgentError> {
        let status = self.gateway.job_status().await?;
        if status.filename.is_empty() {
            return Err(AgentError::Printer("job reported without a file".into()));
        }
        let source = status
            .file_path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.gcode_dir.join(&status.filename));
        let gcode_file = Path::new(&status.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| status.filename.clone());
        let name = Path::new(&gcode_file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| gcode_file.clone());
        let start_time = timestamp_now();
        let long_name = format!("{name}_{start_time}");

        let dir = self.config.data_dir.join(long_name.replace(':', "-"));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::io(&dir, e))?;

        let snapshot = dir.join(&gcode_file);
        let gcode = match tokio::fs::copy(&source, &snapshot).await {
            Ok(_) => Some(snapshot),
            Err(err) => {
                warn!(source = %source.display(), error = %err, "failed to copy G-code file");
                None
            }
        };
        let csv_path = dir.join(LOG_FILE);
        let (cursor, log) = open_artifacts(gcode.clone(), csv_path.clone()).await;

        info!(job = %long_name, dir = %dir.display(), "new job");
        Ok(JobRecord {
            name,
            long_name,
            dir,
            gcode,
            cursor,
            log,
            csv_path,
            frames: 0,
            upload_attempts: 0,
            start_time,
            end_time: None,
            baseline: Readings::new(MotionFactors::default(), &Temperatures::default()),
        })
    }

    /// Take the first readings and report the job start.
    async fn announce(&self, job: &mut JobRecord) {
        job.baseline = self.readings(None).await;
        let Some(gcode) = job.gcode.as_deref() else {
            return;
        };
        let meta = JobStartMeta {
            name: job.name.clone(),
            long_name: job.long_name.clone(),
            gcode_file: job.gcode_file(),
            start_time: job.start_time.clone(),
        };
        if let Err(err) = self.cloud.upload_job_start(&meta, gcode).await {
            warn!(job = %job.long_name, error = %err, "job start upload failed");
        }
    }

    /// Fresh readings, falling back to `previous` (or defaults) per source.
    async fn readings(&self, previous: Option<Readings>) -> Readings {
        let (motion, temps) = tokio::join!(self.gateway.motion_factors(), self.gateway.temperatures());
        let fallback = previous.unwrap_or_else(|| Readings::new(MotionFactors::default(), &Temperatures::default()));
        let motion = motion.unwrap_or_else(|err| {
            debug!(error = %err, "motion factors unavailable");
            fallback.motion
        });
        match temps {
            Ok(temps) => Readings::new(motion, &temps),
            Err(err) => {
                debug!(error = %err, "temperatures unavailable");
                Readings { motion, ..fallback }
            }
        }
    }

    async fn capture(&self, job: &mut JobRecord) -> TickOutcome {
        job.frames += 1;
        let count = job.frames;
        let readings = self.readings(Some(job.baseline)).await;
        job.baseline = readings;
        let settings = self.settings.current();
        let timestamp = timestamp_now();

        let row = match self.append_row(job, count, &timestamp, readings).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job = %job.long_name, error = %err, "telemetry row skipped");
                false
            }
        };

        let image = format!("image_{count}.png");
        let meta = FrameMeta {
            name: image.clone(),
            img_file: image,
            count,
            timestamp,
            flow_rate: readings.motion.flow_rate * 100.0,
            feed_rate: readings.motion.feed_rate * 100.0,
            z_offset: readings.motion.z_offset,
            hotend_target: readings.hotend.0,
            hotend_actual: readings.hotend.1,
            bed_target: readings.bed.0,
            bed_actual: readings.bed.1,
            nozzle_tip_coords_x: settings.nozzle_tip.x,
            nozzle_tip_coords_y: settings.nozzle_tip.y,
            flip_h: settings.transforms.flip_h,
            flip_v: settings.transforms.flip_v,
            rotate: settings.transforms.rotate,
        };
        let frame = match self.upload_frame(&meta, settings.transforms).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job = %job.long_name, count, error = %err, "frame skipped");
                false
            }
        };
        TickOutcome::Captured { row, frame }
    }

    async fn append_row(
        &self,
        job: &mut JobRecord,
        count: u64,
        timestamp: &str,
        readings: Readings,
    ) -> Result<(), AgentError> {
        if job.log.is_none() {
            return Err(AgentError::Config("telemetry log is not open".into()));
        }
        let status = self.gateway.job_status().await?;
        let file_position = if status.file_size == 0 {
            0
        } else {
            status.file_position
        };
        let settings = self.settings.current();
        let row = TelemetryRow {
            count,
            timestamp: timestamp.to_owned(),
            flow_rate: readings.motion.flow_rate * 100.0,
            feed_rate: readings.motion.feed_rate * 100.0,
            z_offset: readings.motion.z_offset,
            target_hotend: readings.hotend.0,
            hotend: readings.hotend.1,
            target_bed: readings.bed.0,
            bed: readings.bed.1,
            line_number: 0,
            command: String::new(),
            file_position,
            nozzle_x: settings.nozzle_tip.x,
            nozzle_y: settings.nozzle_tip.y,
            flip_h: settings.transforms.flip_h,
            flip_v: settings.transforms.flip_v,
            rotate: settings.transforms.rotate,
        };

        let Some(mut log) = job.log.take() else {
            return Err(AgentError::Config("telemetry log is not open".into()));
        };
        let mut cursor = job.cursor.take();
        let (log, cursor, written) = tokio::task::spawn_blocking(move || {
            let written = write_row(&mut log, cursor.as_mut(), row);
            (log, cursor, written)
        })
        .await
        .map_err(|e| AgentError::Session(format!("telemetry task failed: {e}")))?;
        job.log = Some(log);
        job.cursor = cursor;
        written
    }

    async fn upload_frame(
        &self,
        meta: &FrameMeta,
        transforms: printsync_protocol::WebcamTransforms,
    ) -> Result<(), AgentError> {
        let raw = self.frames.capture().await?;
        let png = transform_frame(raw, transforms).await?;
        self.cloud.upload_frame(meta, png).await
    }

    async fn upload_finished(&self, job: &JobRecord) -> Result<(), AgentError> {
        let meta = JobEndMeta {
            name: job.name.clone(),
            long_name: job.long_name.clone(),
            csv_file: LOG_FILE.to_owned(),
            gcode_file: job.gcode_file(),
            start_time: job.start_time.clone(),
            end_time: job.end_time.clone().unwrap_or_else(timestamp_now),
        };
        self.cloud
            .upload_job_end(&meta, &job.csv_path, job.gcode.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_rows_follow_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        let mut log = TelemetryLog::create(path.clone()).unwrap();
        log.append(&TelemetryRow {
            count: 1,
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            flow_rate: 100.0,
            feed_rate: 95.0,
            z_offset: 0.1,
            target_hotend: 210.0,
            hotend: 209.5,
            target_bed: 60.0,
            bed: 59.8,
            line_number: 12,
            command: "G1 X1, Y2".into(),
            file_position: 340,
            nozzle_x: 10,
            nozzle_y: 12,
            flip_h: true,
            flip_v: false,
            rotate: false,
        })
        .unwrap();
        log.close().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), LOG_HEADER.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][9], "12");
        assert_eq!(&rows[0][10], "G1 X1, Y2");
        assert_eq!(&rows[0][14], "true");
    }
}
