use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateFlags {
    pub operational: bool,
    pub paused: bool,
    pub printing: bool,
    pub pausing: bool,
    pub cancelling: bool,
    pub ready: bool,
    pub error: bool,
    pub closed_or_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub flags: StateFlags,
}

impl PrinterState {
    /// A job exists while the printer is printing, paused or on its way to paused.
    pub fn has_job(&self) -> bool {
        self.flags.printing || self.flags.paused || self.flags.pausing
    }

    pub fn is_operational(&self) -> bool {
        self.flags.ready || self.flags.operational
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    #[serde(default)]
    pub actual: f64,
    #[serde(default)]
    pub target: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Heater readings keyed by heater name (`tool0`, `bed`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Temperatures(pub BTreeMap<String, HeaterReading>);

impl Temperatures {
    pub fn hotend(&self) -> HeaterReading {
        self.0.get("tool0").copied().unwrap_or_default()
    }

    pub fn bed(&self) -> HeaterReading {
        self.0.get("bed").copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub file: JobFile,
    pub estimated_print_time: f64,
    pub filament: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Percent, 0-100.
    pub completion: f64,
    pub print_time: f64,
    pub print_time_left: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterData {
    pub state: PrinterState,
    pub job: JobSummary,
    pub progress: Progress,
    #[serde(default)]
    pub offsets: BTreeMap<String, Value>,
}
