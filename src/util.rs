use serde::Serialize;
use std::path::Path;

/// Wall-clock unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Pretty-print a payload for a debug log line, skipping the serialization
/// entirely when DEBUG is not enabled.
pub(crate) fn with_pretty_json_debug<T, F>(value: &T, log_action: F)
where
    T: Serialize,
    F: FnOnce(&str),
{
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    let pretty_json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|error| format!("<pretty serialize failed: {error}>"));
    log_action(pretty_json.as_str());
}

/// Install the tracing subscriber. With `debug` on, a second fmt layer
/// writes everything to a dated file under `log_dir`.
pub fn init_logging(debug: bool, log_dir: &Path) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let registry = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_target(false),
    );

    if debug {
        if let Some(file) = open_debug_log(log_dir) {
            let _ = registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .try_init();
            return;
        }
    }
    let _ = registry.try_init();
}

fn open_debug_log(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    let name = format!(
        "antigravity-{}.log",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    );
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(name))
        .ok()
}

/// Truncate a body for log lines.
pub(crate) fn preview(body: &str, max_chars: usize) -> String {
    body.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| format!("{}...<truncated>", &body[..idx]))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc...<truncated>");
        assert_eq!(preview("ééééé", 2), "éé...<truncated>");
    }
}
