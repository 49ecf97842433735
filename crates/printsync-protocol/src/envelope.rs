//! The outbound telemetry envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::files::FileListing;
use crate::printer::{PrinterData, Temperatures};
use crate::settings::{NozzleTip, WebcamTransforms};
use crate::system::SystemInfo;

pub const PACKET_KIND: &str = "printer_packet";

/// Live printer fields, present only while the printer answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    /// Human-readable state text (`Printing`, `Operational`, ...).
    pub state: String,
    pub temperature_data: Temperatures,
    pub printer_data: PrinterData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandList {
    pub command_list: Vec<String>,
}

/// Reply-specific fields merged into the envelope's top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transforms: Option<WebcamTransforms>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_commands: Option<CommandList>,
}

impl EnvelopeExtra {
    pub fn terminal_commands(commands: Vec<String>) -> Self {
        Self {
            terminal_commands: Some(CommandList {
                command_list: commands,
            }),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    pub timestamp: String,
    pub files: FileListing,
    pub terminal_cmds: Vec<String>,
    pub system: SystemInfo,
    pub nozzle_tip_coords: NozzleTip,
    pub webcam_transforms: WebcamTransforms,
    #[serde(flatten)]
    pub printer: Option<PrinterSnapshot>,
    #[serde(flatten)]
    pub extra: EnvelopeExtra,
}
