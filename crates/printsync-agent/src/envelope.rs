//! Builds outbound envelopes from the gateway, settings and host snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use printsync_protocol::{
    EnvelopeExtra, FileListing, JobFile, JobSummary, OutboundEnvelope, PACKET_KIND, PrinterData,
    PrinterSnapshot, Progress,
};
use tracing::debug;

use crate::config::SettingsHandle;
use crate::gateway::{JobStatus, PrinterGateway};
use crate::system::HostSampler;
use crate::util::timestamp_now;

/// Prints younger than this many seconds use the slicer estimate.
const YOUNG_PRINT_SECS: f64 = 20.0;
const YOUNG_PRINT_PROGRESS: f64 = 0.05;

/// Anything that can produce a fresh envelope on demand.
#[async_trait]
pub trait EnvelopeSource: Send + Sync {
    async fn envelope(&self, extra: EnvelopeExtra) -> OutboundEnvelope;
}

/// Total print time extrapolated from progress.
///
/// `Some(0.0)` when nothing is printing, `None` while the print is too young
/// to extrapolate and the slicer estimate should be used instead.
pub fn extrapolated_print_time(status: &JobStatus) -> Option<f64> {
    if status.filename.is_empty() || !status.is_active {
        return Some(0.0);
    }
    if status.print_duration < YOUNG_PRINT_SECS || status.progress < YOUNG_PRINT_PROGRESS {
        return None;
    }
    Some(status.print_duration / status.progress)
}

pub struct EnvelopeAssembler {
    gateway: Arc<dyn PrinterGateway>,
    settings: SettingsHandle,
    system: HostSampler,
    fetch_count: usize,
}

impl EnvelopeAssembler {
    pub fn new(
        gateway: Arc<dyn PrinterGateway>,
        settings: SettingsHandle,
        system: HostSampler,
        fetch_count: usize,
    ) -> Self {
        Self {
            gateway,
            settings,
            system,
            fetch_count,
        }
    }

    /// Snapshot the device. Gateway failures drop the affected fields.
    pub async fn assemble(&self, extra: EnvelopeExtra) -> OutboundEnvelope {
        let (files, commands, firmware, printer) = tokio::join!(
            self.files(),
            self.gateway.recent_commands(self.fetch_count),
            self.gateway.firmware_version(),
            self.printer_snapshot(),
        );
        let terminal_cmds = commands.unwrap_or_else(|err| {
            debug!(error = %err, "recent commands unavailable");
            Vec::new()
        });
        let settings = self.settings.current();
        OutboundEnvelope {
            kind: PACKET_KIND.to_owned(),
            token: settings.auth_token.clone(),
            timestamp: timestamp_now(),
            files,
            terminal_cmds,
            system: self.system.info(firmware.ok()),
            nozzle_tip_coords: settings.nozzle_tip,
            webcam_transforms: settings.transforms,
            printer,
            extra,
        }
    }

    async fn files(&self) -> FileListing {
        let mut listing = FileListing::default();
        match self.gateway.file_tree().await {
            Ok(entries) => {
                for entry in entries {
                    listing.insert(&entry.path, entry.size, entry.modified);
                }
            }
            Err(err) => debug!(error = %err, "file list unavailable"),
        }
        listing
    }

    async fn printer_snapshot(&self) -> Option<PrinterSnapshot> {
        let (state, temps, job) = tokio::join!(
            self.gateway.state(),
            self.gateway.temperatures(),
            self.gateway.job_status(),
        );
        let state = match state {
            Ok(state) => state,
            Err(err) => {
                debug!(error = %err, "printer offline, omitting printer fields");
                return None;
            }
        };
        let job = job.unwrap_or_default();

        let estimated = match extrapolated_print_time(&job) {
            Some(estimate) => estimate,
            None => self
                .gateway
                .estimated_print_time(&job.filename)
                .await
                .unwrap_or_else(|err| {
                    debug!(file = %job.filename, error = %err, "no slicer estimate");
                    0.0
                }),
        };

        Some(PrinterSnapshot {
            state: state.text.clone(),
            temperature_data: temps.unwrap_or_default(),
            printer_data: PrinterData {
                state,
                job: JobSummary {
                    file: JobFile {
                        name: job.filename.clone(),
                        size: job.file_size,
                    },
                    estimated_print_time: estimated,
                    filament: job.filament_used,
                },
                progress: Progress {
                    completion: job.progress * 100.0,
                    print_time: job.print_duration,
                    print_time_left: estimated - job.print_duration,
                },
                offsets: Default::default(),
            },
        })
    }
}

#[async_trait]
impl EnvelopeSource for EnvelopeAssembler {
    async fn envelope(&self, extra: EnvelopeExtra) -> OutboundEnvelope {
        self.assemble(extra).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(duration: f64, progress: f64) -> JobStatus {
        JobStatus {
            filename: "cube.gcode".into(),
            progress,
            print_duration: duration,
            is_active: true,
            ..JobStatus::default()
        }
    }

    #[test]
    fn idle_printer_has_no_estimate() {
        assert_eq!(extrapolated_print_time(&JobStatus::default()), Some(0.0));
        let inactive = JobStatus {
            is_active: false,
            ..status(100.0, 0.5)
        };
        assert_eq!(extrapolated_print_time(&inactive), Some(0.0));
    }

    #[test]
    fn young_prints_defer_to_the_slicer() {
        assert_eq!(extrapolated_print_time(&status(10.0, 0.5)), None);
        assert_eq!(extrapolated_print_time(&status(600.0, 0.01)), None);
    }

    #[test]
    fn established_prints_extrapolate() {
        assert_eq!(extrapolated_print_time(&status(300.0, 0.25)), Some(1200.0));
    }
}
