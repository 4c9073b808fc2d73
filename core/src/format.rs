//! Human readable formatting for durations and memory sizes

use std::time::Duration;

const PERIODS: [(&str, u64); 6] = [
    ("year", 60 * 60 * 24 * 365),
    ("month", 60 * 60 * 24 * 30),
    ("day", 60 * 60 * 24),
    ("hour", 60 * 60),
    ("minute", 60),
    ("second", 1),
];

/// Format a duration as e.g. `"1 hour, 2 minutes, 5 seconds"`.
///
/// Sub-second durations read `"0 seconds"`; zero-valued units are skipped.
pub fn format_duration(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    if seconds == 0 {
        return "0 seconds".to_string();
    }

    let mut parts = Vec::new();
    for (name, period) in PERIODS {
        if seconds >= period {
            let value = seconds / period;
            seconds %= period;
            let plural = if value > 1 { "s" } else { "" };
            parts.push(format!("{value} {name}{plural}"));
        }
    }
    parts.join(", ")
}

/// Round `value` to `digits` significant digits
pub fn round_significant(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return 0.0;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let exponent = digits as i32 - 1 - magnitude;
    if exponent >= 0 {
        let scale = 10f64.powi(exponent);
        (value * scale).round() / scale
    } else {
        let scale = 10f64.powi(-exponent);
        (value / scale).round() * scale
    }
}

/// Format a resident memory size in bytes as MB or GB with at most two significant digits
pub fn format_memory(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{} GB", trim_float(round_significant(bytes / GB, 2)))
    } else {
        format!("{} MB", trim_float(round_significant(bytes / MB, 2)))
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    text.to_string()
}
