use crate::utils::floor_char_boundary;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("Failed to compile ANSI escape regex")
});

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:[a-zA-Z0-9.+/-]+;base64,[A-Za-z0-9+/=]{64,}")
        .expect("Failed to compile data URI regex")
});

static LONG_BASE64: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9+/]{256,}={0,2}").expect("Failed to compile base64 regex")
});

/// Replace inline binary payloads with short placeholders so the readable
/// part of a result survives truncation.
pub fn strip_binary_blobs(text: &str) -> String {
    let result = DATA_URI.replace_all(text, |caps: &Captures| {
        let full = &caps[0];
        let mime = full
            .strip_prefix("data:")
            .and_then(|s| s.split(';').next())
            .unwrap_or("unknown");
        let data_len = full.find(',').map_or(0, |i| full.len() - i - 1);
        format!("[{} data, {} bytes]", mime, data_len)
    });

    // plain words never contain '+', '/' or '=' so require one of them
    let result = LONG_BASE64.replace_all(&result, |caps: &Captures| {
        let matched = &caps[0];
        if matched.contains(['+', '/', '=']) {
            format!("[base64 data, {} bytes]", matched.len())
        } else {
            matched.to_string()
        }
    });

    result.into_owned()
}

/// Clip a tool payload to `max_chars` bytes. JSON payloads are pretty-printed
/// first; the cut lands on a char boundary and ends with a marker telling the
/// model not to re-run the call.
pub fn truncate_tool_result(result: &str, max_chars: usize) -> String {
    let clean = ANSI_ESCAPE.replace_all(result, "");
    let clean = strip_binary_blobs(&clean);

    if clean.len() <= max_chars {
        return clean;
    }

    // the marker alone would overflow a tiny budget
    if max_chars < 120 {
        let safe = floor_char_boundary(&clean, max_chars);
        return clean[..safe].to_string();
    }

    let trimmed = clean.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && let Ok(parsed) = serde_json::from_str::<Value>(&clean)
        && let Ok(pretty) = serde_json::to_string_pretty(&parsed)
    {
        if pretty.len() <= max_chars {
            return pretty;
        }
        let safe = floor_char_boundary(&pretty, max_chars - 120);
        return format!(
            "{}\n\n... [JSON truncated - showed {} of {} chars. Do NOT re-run this tool to see more.]",
            &pretty[..safe],
            safe,
            pretty.len()
        );
    }

    let safe = floor_char_boundary(&clean, max_chars - 100);
    format!(
        "{}\n\n... [truncated - showed {} of {} chars. Do NOT re-run this tool to see more.]",
        &clean[..safe],
        safe,
        clean.len()
    )
}

#[cfg(test)]
mod tests;
