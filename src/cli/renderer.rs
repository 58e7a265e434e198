use chrono::Utc;
use colored::{control, ColoredString, Colorize};

use crate::core::coordinator::UpdateFailure;
use crate::core::error::FailureReason;
use crate::core::formatter::{format_age, format_count, format_health_bar, format_value};
use crate::core::models::snapshot::Snapshot;
use crate::core::points::{error_rate, readings, PointKind, Sensor};

const BAR_WIDTH: usize = 12;

/// Render a snapshot block as a colored (or plain) string.
///
/// Layout:
/// ```text
///  CLIProxyAPI http://127.0.0.1:8317 (reachable)
///   Requests  120 total, 118 ok, 2 failed
///   Errors    1.67% [████████████]
///   Tokens    48.2K
///   Version   v6.1.0
///   Keys:
///     k1                 80 requests (1 failed, 30.1K tokens)
///   Models:
///     gpt-5              70 requests (30.0K tokens, 1.2K cached)
///   Settings:
///     debug              off
///   Logs      12 lines, latest 2024-01-01T00:00:00+00:00
/// ```
pub fn render_snapshot(
    snapshot: &Snapshot,
    base_url: &str,
    reachable: bool,
    use_color: bool,
) -> String {
    control::set_override(use_color);

    let mut lines: Vec<String> = Vec::new();

    let state: ColoredString = if reachable {
        "reachable".green()
    } else {
        "unreachable".red()
    };
    let mut header = format!(" {} {} ({})", "CLIProxyAPI".bold(), base_url, state);
    if let Some(at) = &snapshot.fetched_at {
        header.push_str(&format!(" {}", format_age(at, &Utc::now()).dimmed()));
    }
    lines.push(header);

    lines.push(format!(
        "  {}  {} total, {} ok, {} failed",
        "Requests".cyan(),
        format_value(&Sensor::TotalRequests.value(snapshot)),
        format_value(&Sensor::SuccessCount.value(snapshot)),
        format_value(&Sensor::FailedRequests.value(snapshot)),
    ));

    let rate = error_rate(snapshot);
    lines.push(format!(
        "  {}    {} {}",
        "Errors".cyan(),
        color_by_error_rate(rate, &format!("{:.2}%", rate)),
        format_health_bar(rate, BAR_WIDTH).magenta()
    ));
    lines.push(format!(
        "  {}    {}",
        "Tokens".cyan(),
        format_value(&Sensor::TotalTokens.value(snapshot))
    ));
    lines.push(format!(
        "  {}   {}",
        "Version".cyan(),
        format_value(&Sensor::LatestVersion.value(snapshot))
    ));

    if !snapshot.key_usage.is_empty() {
        lines.push(format!("  {}:", "Keys".cyan()));
        for (auth_index, usage) in &snapshot.key_usage {
            let failed = if usage.failed > 0 {
                format!("{} failed", usage.failed).red()
            } else {
                "0 failed".normal()
            };
            lines.push(format!(
                "    {:<18} {} requests ({}, {} tokens)",
                auth_index,
                format_count(usage.requests),
                failed,
                format_count(usage.tokens)
            ));
        }
    }

    if !snapshot.model_token_usage.is_empty() {
        lines.push(format!("  {}:", "Models".cyan()));
        for (model, usage) in &snapshot.model_token_usage {
            lines.push(format!(
                "    {:<18} {} requests ({} tokens, {} cached)",
                model,
                format_count(usage.requests),
                format_count(usage.total_tokens),
                format_count(usage.cached_tokens)
            ));
        }
    }

    lines.push(format!("  {}:", "Settings".cyan()));
    for reading in readings(snapshot, reachable)
        .iter()
        .filter(|r| matches!(r.kind, PointKind::Switch | PointKind::Number))
    {
        let value = format_value(&reading.value);
        let value = match &reading.value {
            serde_json::Value::Bool(true) => value.green(),
            serde_json::Value::Bool(false) => value.dimmed(),
            _ => value.normal(),
        };
        let unit = reading.unit.map(|u| format!(" {}", u)).unwrap_or_default();
        lines.push(format!("    {:<18} {}{}", reading.key, value, unit));
    }

    if Sensor::LogLineCount.available(snapshot) {
        lines.push(format!(
            "  {}      {} lines, latest {}",
            "Logs".cyan(),
            snapshot.logs.line_count,
            format_value(&Sensor::LatestLogTimestamp.value(snapshot))
        ));
    }
    if Sensor::RequestErrorLogFiles.available(snapshot) {
        lines.push(format!(
            "  {} {}",
            "Error logs".cyan(),
            snapshot.request_error_logs.len()
        ));
    }

    lines.join("\n")
}

/// Render an update failure as a header plus a red message line.
pub fn render_failure(base_url: &str, failure: &UpdateFailure, use_color: bool) -> String {
    control::set_override(use_color);
    let label = match failure.reason {
        FailureReason::Authentication => "authentication failed",
        FailureReason::Connection => "unreachable",
        FailureReason::Other => "error",
    };
    format!(
        " {} {} ({})\n  {}",
        "CLIProxyAPI".bold(),
        base_url,
        label.red(),
        failure.message.red()
    )
}

/// Color the rate string green/yellow/red based on failure share.
fn color_by_error_rate(rate: f64, text: &str) -> ColoredString {
    if rate < 5.0 {
        text.green()
    } else if rate < 20.0 {
        text.yellow()
    } else {
        text.red()
    }
}
