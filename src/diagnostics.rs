//! Opt-in startup timing log. Startup problems often happen before the
//! event log is configured, so this writes to its own file, gated on an
//! environment variable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const STARTUP_DEBUG_ENV: &str = "REPL_HOST_DEBUG_STARTUP";
const DEFAULT_LOG_FILE: &str = "repl-host-startup.log";

struct StartupLog {
    epoch: Instant,
    file: Mutex<File>,
}

static STARTUP: OnceLock<Option<StartupLog>> = OnceLock::new();

/// Append a timing line when `REPL_HOST_DEBUG_STARTUP` is set. A value of
/// `1` or `true` appends to `repl-host-startup.log` in the working
/// directory; any other value is taken as the log file path.
pub fn startup_log(message: impl AsRef<str>) {
    let log = STARTUP.get_or_init(|| {
        let value = std::env::var(STARTUP_DEBUG_ENV).ok()?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let path = match value {
            "1" | "true" => DEFAULT_LOG_FILE,
            path => path,
        };
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        Some(StartupLog {
            epoch: Instant::now(),
            file: Mutex::new(file),
        })
    });
    let Some(log) = log else {
        return;
    };
    if let Ok(mut file) = log.file.lock() {
        let _ = writeln!(
            *file,
            "[repl-host][startup +{:>6}ms] {}",
            log.epoch.elapsed().as_millis(),
            message.as_ref()
        );
        let _ = file.flush();
    }
}
