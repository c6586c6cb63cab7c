//! Time helpers shared by the scheduler, control loop and logging.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;

/// Current unix time in fractional seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Render a signed duration as `1h2m3s`, omitting zero components.
pub fn seconds_to_hms(seconds: i64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    let negative = seconds < 0;
    let mut s = seconds.unsigned_abs();
    let mut out = String::new();
    if s % 60 > 0 {
        out = format!("{}s", s % 60);
    }
    s /= 60;
    if s % 60 > 0 {
        out = format!("{}m{out}", s % 60);
    }
    s /= 60;
    if s > 0 {
        out = format!("{s}h{out}");
    }
    if negative {
        out.insert(0, '-');
    }
    out
}

/// Render a unix time as an RFC 3339 UTC timestamp.
pub fn format_unix_time(t: i64) -> String {
    DateTime::from_timestamp(t, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| t.to_string())
}
