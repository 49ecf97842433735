//! Printer Gateway: request/response access to the printer controller.

pub mod moonraker;

use std::collections::BTreeMap;

use async_trait::async_trait;
use printsync_protocol::{PrinterState, Temperatures};

use crate::error::AgentError;

pub use moonraker::MoonrakerGateway;

/// Progress of the current (or last) print as reported by the controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus {
    /// File name relative to the G-code root; empty when no file is loaded.
    pub filename: String,
    /// Absolute path of the file on the controller host, when known.
    pub file_path: Option<String>,
    /// Fraction 0.0-1.0.
    pub progress: f64,
    pub print_duration: f64,
    pub total_duration: f64,
    pub filament_used: f64,
    pub file_position: u64,
    pub file_size: u64,
    pub is_active: bool,
}

/// Live motion tuning values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionFactors {
    /// Extrusion multiplier, 1.0 = 100%.
    pub flow_rate: f64,
    /// Speed multiplier, 1.0 = 100%.
    pub feed_rate: f64,
    pub z_offset: f64,
}

impl Default for MotionFactors {
    fn default() -> Self {
        Self {
            flow_rate: 1.0,
            feed_rate: 1.0,
            z_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayAction {
    Home { axes: Vec<String> },
    /// Relative jog, distances in mm keyed by axis.
    Jog { axes: BTreeMap<String, f64> },
    Extrude { amount: f64 },
    SetTemperature { heater: Heater, value: f64 },
    Pause,
    Resume,
    Cancel,
    ClearPrintStats,
    StartPrint { filename: String },
    UploadFile { filename: String, content: Vec<u8> },
    DeleteFile { filename: String },
    CreateFolder { path: String },
    Gcode { script: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    Bed,
    Hotend,
}

impl Heater {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bed" => Some(Heater::Bed),
            "hotend" | "tool0" => Some(Heater::Hotend),
            _ => None,
        }
    }
}

impl GatewayAction {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayAction::Home { .. } => "home",
            GatewayAction::Jog { .. } => "jog",
            GatewayAction::Extrude { .. } => "extrude",
            GatewayAction::SetTemperature { .. } => "set_temperature",
            GatewayAction::Pause => "pause",
            GatewayAction::Resume => "resume",
            GatewayAction::Cancel => "cancel",
            GatewayAction::ClearPrintStats => "clear_print_stats",
            GatewayAction::StartPrint { .. } => "start_print",
            GatewayAction::UploadFile { .. } => "upload_file",
            GatewayAction::DeleteFile { .. } => "delete_file",
            GatewayAction::CreateFolder { .. } => "create_folder",
            GatewayAction::Gcode { .. } => "gcode",
        }
    }

    /// G-code script for actions that are plain command sequences.
    pub fn script(&self) -> Option<String> {
        match self {
            GatewayAction::Home { axes } => {
                let mut cmd = String::from("G28");
                for axis in axes {
                    cmd.push(' ');
                    cmd.push_str(axis);
                }
                Some(cmd)
            }
            GatewayAction::Jog { axes } => {
                let mut cmd = String::from("G91\n");
                for (axis, distance) in axes {
                    cmd.push_str(&format!("G0 {}{}\n", axis.to_uppercase(), distance));
                }
                Some(cmd)
            }
            GatewayAction::Extrude { amount } => Some(format!("G1 E{amount}")),
            GatewayAction::SetTemperature { heater, value } => Some(match heater {
                Heater::Bed => format!("M140 S{value}"),
                Heater::Hotend => format!("M104 S{value}"),
            }),
            GatewayAction::ClearPrintStats => Some("SDCARD_RESET_FILE".into()),
            GatewayAction::Gcode { script } => Some(script.clone()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PrinterGateway: Send + Sync {
    async fn state(&self) -> Result<PrinterState, AgentError>;
    async fn temperatures(&self) -> Result<Temperatures, AgentError>;
    async fn job_status(&self) -> Result<JobStatus, AgentError>;
    async fn motion_factors(&self) -> Result<MotionFactors, AgentError>;
    async fn recent_commands(&self, count: usize) -> Result<Vec<String>, AgentError>;
    async fn file_tree(&self) -> Result<Vec<FileEntry>, AgentError>;
    async fn firmware_version(&self) -> Result<String, AgentError>;
    /// Slicer-estimated duration for a stored file, in seconds.
    async fn estimated_print_time(&self, filename: &str) -> Result<f64, AgentError>;
    async fn send_action(&self, action: GatewayAction) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_match_firmware_syntax() {
        let home = GatewayAction::Home {
            axes: vec!["X".into(), "Y".into()],
        };
        assert_eq!(home.script().unwrap(), "G28 X Y");
        assert_eq!(
            GatewayAction::Home { axes: vec![] }.script().unwrap(),
            "G28"
        );

        let mut axes = BTreeMap::new();
        axes.insert("x".to_string(), 10.0);
        axes.insert("z".to_string(), -0.5);
        assert_eq!(
            GatewayAction::Jog { axes }.script().unwrap(),
            "G91\nG0 X10\nG0 Z-0.5\n"
        );

        assert_eq!(
            GatewayAction::SetTemperature {
                heater: Heater::Bed,
                value: 60.0
            }
            .script()
            .unwrap(),
            "M140 S60"
        );
        assert_eq!(
            GatewayAction::Extrude { amount: -2.5 }.script().unwrap(),
            "G1 E-2.5"
        );
        assert!(GatewayAction::Pause.script().is_none());
    }

    #[test]
    fn heater_aliases() {
        assert_eq!(Heater::from_name("tool0"), Some(Heater::Hotend));
        assert_eq!(Heater::from_name("hotend"), Some(Heater::Hotend));
        assert_eq!(Heater::from_name("bed"), Some(Heater::Bed));
        assert_eq!(Heater::from_name("chamber"), None);
    }
}
