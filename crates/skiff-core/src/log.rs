//! Timestamped logging to stderr and the cache-dir log file.
//! Quiet mode (SKIFF_QUIET=1 or SKIFF_LOG=quiet|error) drops the console copy.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;

pub const LOG_FILE: &str = "logs.txt";

fn is_quiet() -> bool {
    if std::env::var("SKIFF_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    std::env::var("SKIFF_LOG")
        .map(|v| {
            let v = v.to_lowercase();
            v == "quiet" || v == "error"
        })
        .unwrap_or(false)
}

fn log_path() -> PathBuf {
    crate::config::default_cache_dir().join(LOG_FILE)
}

/// Write a timestamped line to stderr (unless quiet) and append it to the log file.
pub fn log(message: &str) {
    let line = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
    if !is_quiet() {
        eprintln!("{}", line);
    }
    let path = log_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", line);
    }
}

/// Log a warning line. Warnings always reach stderr, even in quiet mode.
pub fn warn(message: &str) {
    let line = format!("[{}] warning: {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
    eprintln!("{}", line);
    let path = log_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", line);
    }
}
