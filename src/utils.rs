//! Small helpers shared by the config layer and the summary printers.

use std::time::Duration;

/// Parse a human duration such as `"500ms"`, `"30s"`, `"1.5m"` or `"1h"`.
///
/// A bare number is read as milliseconds. Fractional values are accepted for
/// every unit except milliseconds. Returns `None` for anything else,
/// including negative values.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }

    let (number, scale) = if let Some(v) = s.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600.0)
    } else {
        return s.parse::<u64>().ok().map(Duration::from_millis);
    };

    let value = number.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * scale).ok()
}

/// Render a duration the way the summary prints latencies: `"850.12ms"`,
/// `"2.31s"`, `"1m30s"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{:.2}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        let whole = d.as_secs();
        format!("{}m{}s", whole / 60, whole % 60)
    }
}

/// Render a millisecond value as produced by the trend metrics.
pub fn format_millis(ms: f64) -> String {
    format_duration(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
