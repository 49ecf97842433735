use chrono::{DateTime, Utc};

/// UTC timestamp in `YYYY-MM-DDTHH:MM:SS.sssZ` form.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn timestamp_now() -> String {
    timestamp(Utc::now())
}

/// Human-readable byte count (`512`, `1.5KB`, `2.25GB`).
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value > KB * KB * KB {
        format!("{}GB", round2(value / (KB * KB * KB)))
    } else if value > KB * KB {
        format!("{}MB", round2(value / (KB * KB)))
    } else if value > KB {
        format!("{}KB", round2(value / KB))
    } else {
        bytes.to_string()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
