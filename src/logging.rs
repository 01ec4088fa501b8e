use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

// only the logging keys of the network config, read before the full load so
// that a config error still ends up in the log
#[derive(Deserialize, Debug, Default)]
struct LogSettings {
    #[serde(rename = "logFile", default)]
    log_file: Option<PathBuf>,
    #[serde(rename = "logLevel", default)]
    log_level: Option<String>,
}

fn settings(stdin_data: &str) -> LogSettings {
    serde_json::from_str(stdin_data).unwrap_or_default()
}

fn filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Logs go to `logFile` when set, stderr otherwise. Stdout carries the CNI
/// result and is never written to.
pub fn init(stdin_data: &str) {
    let settings = settings(stdin_data);
    let filter = filter(settings.log_level.as_deref());

    let file = settings.log_file.as_ref().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("cannot open log file {}: {}", path.display(), e))
            .ok()
    });

    let _ = match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
}

#[test]
fn test_settings_from_netconf() {
    let s = settings(r#"{"name":"n","logFile":"/tmp/swan.log","logLevel":"debug"}"#);
    assert_eq!(s.log_file, Some(PathBuf::from("/tmp/swan.log")));
    assert_eq!(s.log_level.as_deref(), Some("debug"));
}

#[test]
fn test_settings_tolerate_garbage() {
    let s = settings("{not json");
    assert!(s.log_file.is_none());
    assert!(s.log_level.is_none());
}

#[test]
fn test_filter_default_level() {
    assert_eq!(filter(None).to_string(), "info");
    assert_eq!(filter(Some("debug")).to_string(), "debug");
}
