use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: String,
    pub total: String,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub software: String,
    /// Firmware version reported by the printer; `null` when it cannot be reached.
    pub version: Option<String>,
    pub os: String,
    pub memory: MemoryUsage,
    #[serde(rename = "plugin_version")]
    pub agent_version: String,
}
