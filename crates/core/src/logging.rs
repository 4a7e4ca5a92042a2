//! Log filter selection, the rolling log file and crash reports.
//!
//! Subscriber assembly lives in the binary; this module only decides
//! directives, opens the file sink and owns the panic hook.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use chrono::Utc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::device::Device;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";

const LOG_FILE_PREFIX: &str = "esrgan";
const RETAINED_LOG_FILES: usize = 14;

/// ONNX Runtime reports every provider and graph optimization at `info`.
const ORT_CONSOLE: &str = "ort=warn";
const ORT_FILE: &str = "ort=info";

/// Directives for the two sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins, then `-v` (debug) / `-vv` (trace), then
    /// `RUST_LOG`, then `info`. ONNX Runtime is only quietened when the
    /// command line did not choose the level; the file keeps its `info` lines.
    pub fn select(flag: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let explicit = match (flag, verbose) {
            (Some(flag), _) => Some(flag),
            (None, 0) => None,
            (None, 1) => Some("debug"),
            (None, _) => Some("trace"),
        };

        match explicit {
            Some(directives) => Self {
                console: directives.to_string(),
                file: directives.to_string(),
            },
            None => {
                let base = rust_log
                    .map(str::trim)
                    .filter(|filter| !filter.is_empty())
                    .unwrap_or(DEFAULT_LOG_FILTER);
                Self {
                    console: format!("{ORT_CONSOLE},{base}"),
                    file: format!("{ORT_FILE},{base}"),
                }
            }
        }
    }
}

/// Daily rolling log under `<data_dir>/logs`.
#[derive(Debug)]
pub struct LogSink {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

pub fn open_log_sink(data_dir: &Path) -> io::Result<LogSink> {
    let dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(RETAINED_LOG_FILES)
        .build(&dir)
        .map_err(io::Error::other)?;

    Ok(LogSink { dir, appender })
}

#[derive(Debug, Clone)]
struct RunContext {
    model: PathBuf,
    device: String,
}

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static RUN_CONTEXT: Mutex<Option<RunContext>> = Mutex::new(None);
static REPORT_SEQ: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CURRENT_INPUT: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// Chain a hook that writes `<data_dir>/logs/crash/crash-*.log` for every
/// panic, then defers to the previous hook. Returns the crash directory.
/// Later calls keep the first directory.
pub fn install_crash_hook(data_dir: &Path) -> io::Result<PathBuf> {
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&dir)?;

    let mut installed_here = false;
    let dir = CRASH_DIR
        .get_or_init(|| {
            installed_here = true;
            dir
        })
        .clone();

    if installed_here {
        let previous = panic::take_hook();
        let hook_dir = dir.clone();
        panic::set_hook(Box::new(move |info| {
            report_panic(&hook_dir, info);
            previous(info);
        }));
    }
    Ok(dir)
}

/// Model and device named in every crash report from now on.
pub fn set_crash_context(model: &Path, device: Device) {
    let mut context = RUN_CONTEXT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *context = Some(RunContext {
        model: model.to_path_buf(),
        device: device.to_string(),
    });
}

/// Marks the image this thread is working on until dropped.
#[must_use]
pub struct CrashScope {
    previous: Option<PathBuf>,
}

impl CrashScope {
    pub fn enter(input: &Path) -> Self {
        let previous = CURRENT_INPUT.with(|slot| slot.replace(Some(input.to_path_buf())));
        Self { previous }
    }
}

impl Drop for CrashScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_INPUT.with(|slot| *slot.borrow_mut() = previous);
    }
}

fn report_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while reporting must not recurse into another report.
    if REPORTING.with(|flag| flag.replace(true)) {
        return;
    }

    let report = CrashReport::capture(info);
    if let Err(error) = report.write_to(dir) {
        eprintln!(
            "Warning: could not write crash report under '{}': {error}",
            dir.display()
        );
    }

    REPORTING.with(|flag| flag.set(false));
}

struct CrashReport {
    at: chrono::DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    context: Option<RunContext>,
    input: Option<PathBuf>,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string payload>".to_string());

        // try_lock: the panic may have happened while the context was held.
        let context = RUN_CONTEXT
            .try_lock()
            .ok()
            .and_then(|context| context.clone());

        Self {
            at: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message,
            context,
            input: CURRENT_INPUT
                .try_with(|slot| slot.try_borrow().ok().and_then(|input| input.clone()))
                .ok()
                .flatten(),
            backtrace: Backtrace::capture(),
        }
    }

    fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let seq = REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "crash-{}-{}-{seq}.log",
            self.at.format("%Y%m%dT%H%M%S%.3fZ"),
            std::process::id()
        ));

        let mut out = io::BufWriter::new(fs::File::create(&path)?);
        writeln!(out, "esrgan {} crash report", env!("CARGO_PKG_VERSION"))?;
        writeln!(out, "time: {}", self.at.to_rfc3339())?;
        writeln!(out, "thread: {}", self.thread)?;
        writeln!(out, "panicked at: {}", self.location)?;
        writeln!(out, "message: {}", self.message)?;
        match &self.context {
            Some(context) => {
                writeln!(out, "model: {}", context.model.display())?;
                writeln!(out, "device: {}", context.device)?;
            }
            None => writeln!(out, "model: <not loaded>")?,
        }
        if let Some(input) = &self.input {
            writeln!(out, "input: {}", input.display())?;
        }
        writeln!(out, "\n{}", self.backtrace)?;
        out.flush()?;
        Ok(path)
    }
}
