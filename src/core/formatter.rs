use chrono::{DateTime, Utc};
use serde_json::Value;

/// Returns "1.2M", "3.4K" or the plain count.
pub fn format_count(count: i64) -> String {
    let abs = count.unsigned_abs();
    if abs >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if abs >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        format!("{}", count)
    }
}

/// Returns "[████████░░░░]" where █ = successful share, ░ = failed share.
pub fn format_health_bar(error_rate: f64, width: usize) -> String {
    let error_rate = error_rate.clamp(0.0, 100.0);
    let failed_blocks = ((error_rate / 100.0) * width as f64).round() as usize;
    let ok_blocks = width.saturating_sub(failed_blocks);

    format!("[{}{}]", "█".repeat(ok_blocks), "░".repeat(failed_blocks))
}

/// Returns "updated 12s ago", "updated 3m ago", "updated 2h ago".
pub fn format_age(at: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let seconds = (*now - *at).num_seconds().max(0);
    if seconds < 60 {
        format!("updated {}s ago", seconds)
    } else if seconds < 3600 {
        format!("updated {}m ago", seconds / 60)
    } else {
        format!("updated {}h ago", seconds / 3600)
    }
}

/// Human form of a point value: bools as on/off, null as a dash.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => format_count(i),
            None => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
