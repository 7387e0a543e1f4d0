// src/logging.rs
//
// Timestamped log lines on stderr, optionally mirrored into a per-session
// file under the configured log directory. Older session files are pruned
// so the directory does not grow without bound.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Session log file; `None` until file logging starts
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Every session file ends with this, after a `%Y%m%d-%H%M%S-` stamp
const SESSION_SUFFIX: &str = "-pio-bridge.log";
/// Symlink to the newest session file (Unix only)
const LATEST_LOG_NAME: &str = "pio-bridge.log";

fn stamp() -> impl fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one line to stderr and, when open, the session file
pub(crate) fn emit(args: fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), args);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Timestamped log line, e.g. `tlog!("[bridge] Opened {}", path)`
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

fn is_session_file(name: &str) -> bool {
    name.len() > SESSION_SUFFIX.len() && name.ends_with(SESSION_SUFFIX)
}

/// Open a new session file in `log_dir`, repoint the latest link, and drop
/// all but the `keep` newest sessions. Returns the session file path.
pub(crate) fn init_file_logging(log_dir: &Path, keep: usize) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let file_name = format!("{}{}", chrono::Local::now().format("%Y%m%d-%H%M%S"), SESSION_SUFFIX);
    let log_path = log_dir.join(&file_name);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open {}: {}", log_path.display(), e))?;

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    tlog!("[logging] File logging started: {}", log_path.display());

    refresh_latest_link(log_dir, &file_name);
    let removed = prune_old_logs(log_dir, keep);
    if removed > 0 {
        tlog!("[logging] Removed {} old log file(s)", removed);
    }
    Ok(log_path)
}

#[cfg(unix)]
fn refresh_latest_link(log_dir: &Path, file_name: &str) {
    let link = log_dir.join(LATEST_LOG_NAME);
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(file_name, &link) {
        tlog!("[logging] Could not link {}: {}", LATEST_LOG_NAME, e);
    }
}

// Symlinks need elevated privileges on Windows
#[cfg(not(unix))]
fn refresh_latest_link(_log_dir: &Path, _file_name: &str) {}

/// Delete session files beyond the `keep` newest. The timestamp prefix sorts
/// lexically, so name order is age order. `keep == 0` keeps everything.
pub(crate) fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if keep == 0 {
        return 0;
    }
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };

    let mut sessions: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| is_session_file(name))
        .collect();
    sessions.sort_unstable_by(|a, b| b.cmp(a));

    sessions
        .iter()
        .skip(keep)
        .filter(|name| std::fs::remove_file(log_dir.join(name)).is_ok())
        .count()
}

/// Close the session file; later lines go to stderr only
pub(crate) fn stop_file_logging() {
    let closed = LOG_FILE.lock().map(|mut guard| guard.take().is_some());
    if let Ok(true) = closed {
        tlog!("[logging] File logging stopped");
    }
}
