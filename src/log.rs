//! Run logging.
//!
//! maestro is a long-running batch process, so diagnostics go to a file
//! rather than the terminal. The log starts under `~/.maestro/` and is
//! redirected into the run workspace once one is known, so each run
//! keeps its trail next to its checkpoint. Verbosity comes from the
//! `--debug` flag, `MAESTRO_DEBUG=1`, or an explicit
//! `MAESTRO_LOG=<error|warn|info|debug|trace>`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

/// Pick the level from the debug flag and environment, and point the
/// log at `~/.maestro/maestro.log` until a workspace takes over.
pub fn init(debug: bool) {
    let level = std::env::var("MAESTRO_LOG")
        .ok()
        .and_then(|v| Level::parse(&v))
        .unwrap_or(if debug || env_debug() {
            Level::Debug
        } else {
            Level::Info
        });
    LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(home) = dirs::home_dir() {
        let dir = home.join(".maestro");
        let _ = std::fs::create_dir_all(&dir);
        set_path(dir.join("maestro.log"));
    }
}

fn env_debug() -> bool {
    std::env::var("MAESTRO_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Redirect the log into a run workspace. Truncates any previous run's
/// log at that location.
pub fn attach_to_workspace(dir: &Path) {
    let _ = std::fs::create_dir_all(dir);
    set_path(dir.join("maestro.log"));
}

fn set_path(path: PathBuf) {
    let _ = std::fs::write(&path, "");
    if let Ok(mut guard) = LOG_PATH.lock() {
        *guard = Some(path);
    }
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

/// Append one line to the log. Logging failures are swallowed; a run
/// never dies because its log file went away.
pub fn write(level: Level, msg: &str) {
    if !enabled(level) {
        return;
    }
    let guard = match LOG_PATH.lock() {
        Ok(g) => g,
        Err(_) => return,
    };
    let Some(path) = guard.as_ref() else { return };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let ts = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "{} {:5} {}", ts, level.tag(), msg);
    }
}

#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Trace, &format!($($arg)*))
    };
}
