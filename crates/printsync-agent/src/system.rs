use std::sync::{Mutex, PoisonError};

use printsync_protocol::{MemoryUsage, SystemInfo};
use sysinfo::{System, SystemExt};

use crate::util::format_bytes;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host facts reported in every envelope.
pub struct HostSampler {
    software: String,
    sys: Mutex<System>,
}

impl HostSampler {
    pub fn new(software: impl Into<String>) -> Self {
        Self {
            software: software.into(),
            sys: Mutex::new(System::new()),
        }
    }

    pub fn memory(&self) -> MemoryUsage {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        let used = sys.used_memory();
        let total = sys.total_memory();
        let percent = if total == 0 {
            0.0
        } else {
            ((used as f64 / total as f64) * 1000.0).round() / 10.0
        };
        MemoryUsage {
            used: format_bytes(used),
            total: format_bytes(total),
            percent,
        }
    }

    pub fn info(&self, firmware_version: Option<String>) -> SystemInfo {
        SystemInfo {
            software: self.software.clone(),
            version: firmware_version,
            os: std::env::consts::OS.to_owned(),
            memory: self.memory(),
            agent_version: AGENT_VERSION.to_owned(),
        }
    }
}
