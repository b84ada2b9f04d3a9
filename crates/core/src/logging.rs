//! Log filters, the rolling log file and crash reports.
//!
//! Subscribers are assembled by whoever owns the process (the `nss` binary
//! or the host engine); this module decides the filters and opens the sinks.
//! Unless a filter was picked explicitly, ONNX Runtime is held at `error` on
//! the console and at `warn` in the log file.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_RETENTION_FILES: usize = 14;

const ORT_CONSOLE_DIRECTIVE: &str = "ort=error";
const ORT_FILE_DIRECTIVE: &str = "ort=warn";

static HOOK_INSTALL: Mutex<()> = Mutex::new(());
static HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static HOOK_WRITING: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Who owns the process the pipeline runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// The `nss` command line tool.
    Cli,
    /// Embedded in an engine through [`crate::host::HostSession`].
    Host,
}

impl LogMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Host => "host",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            Self::Cli => "nss",
            Self::Host => "nss-host",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open rolling log file in {}: {source}", path.display())]
    Appender {
        path: PathBuf,
        #[source]
        source: InitError,
    },
}

/// Filter inputs from the command line and the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRequest {
    pub verbose: u8,
    pub log_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl FilterRequest {
    pub fn from_env(verbose: u8, log_filter: Option<&str>) -> Self {
        Self {
            verbose,
            log_filter: log_filter.map(str::to_string),
            rust_log: std::env::var("RUST_LOG").ok(),
        }
    }

    /// `--log-filter` wins over `-v`/`-vv`, which win over `RUST_LOG`.
    pub fn resolve(&self) -> LogFilters {
        let base = match (self.log_filter.as_deref(), self.verbose) {
            (Some(filter), _) => filter.to_string(),
            (None, 0) => self
                .rust_log
                .clone()
                .filter(|filter| !filter.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            (None, 1) => "debug".to_string(),
            (None, _) => "trace".to_string(),
        };

        if self.log_filter.is_some() || self.verbose > 0 {
            return LogFilters {
                console: base.clone(),
                file: base,
            };
        }
        LogFilters {
            console: format!("{ORT_CONSOLE_DIRECTIVE},{base}"),
            file: format!("{ORT_FILE_DIRECTIVE},{base}"),
        }
    }
}

/// A daily rolling log file, ready to be used as a subscriber writer.
#[derive(Debug)]
pub struct LogFile {
    pub dir: PathBuf,
    pub writer: RollingFileAppender,
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Opens `<data_dir>/logs/<prefix>.<date>.log`, keeping the newest
/// [`LOG_RETENTION_FILES`] files.
pub fn open_log_file(data_dir: &Path, mode: LogMode) -> Result<LogFile, LoggingError> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|source| LoggingError::CreateDir {
        path: dir.clone(),
        source,
    })?;

    let writer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(mode.file_prefix())
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .map_err(|source| LoggingError::Appender {
            path: dir.clone(),
            source,
        })?;
    Ok(LogFile { dir, writer })
}

/// Installs the process-wide crash hook, which writes one report per panic
/// under `<data_dir>/logs/crash` and then chains to the previous hook.
/// Only the first successful call installs; later calls return its directory.
pub fn install_panic_hook(data_dir: &Path) -> Result<PathBuf, LoggingError> {
    let _guard = HOOK_INSTALL.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(dir) = HOOK_CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = crash_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|source| LoggingError::CreateDir {
        path: dir.clone(),
        source,
    })?;

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));
    let _ = HOOK_CRASH_DIR.set(dir.clone());
    Ok(dir)
}

fn record_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    if HOOK_WRITING.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_into(dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "nss: could not write crash report under '{}': {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "nss: crash report writer panicked under '{}'",
            dir.display()
        ),
    }

    HOOK_WRITING.store(false, Ordering::Release);
}

struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|at| format!("{}:{}:{}", at.file(), at.line(), at.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace: Backtrace::capture(),
        }
    }

    fn write_into(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let backtrace_policy = match self.backtrace.status() {
            BacktraceStatus::Captured => "captured",
            BacktraceStatus::Disabled => "disabled (set RUST_BACKTRACE=1 to capture)",
            BacktraceStatus::Unsupported => "unsupported",
            _ => "unknown",
        };

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={backtrace_policy}")?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;
        Ok(path)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
