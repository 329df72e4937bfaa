//! Minimal timestamped logging for the emulation core.
//!
//! The hot paths call [`log`] unconditionally; until [`init_logger`] runs
//! the calls are no-ops, so tests and embedders that don't care about the
//! trace pay almost nothing.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    sync::Mutex,
    time::Instant,
};

use chrono::Utc;
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<Logger> = OnceCell::new();

/// Where log lines go: the console, or a file in the temp directory named
/// `satsuma-<unix timestamp>.log`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum LogKind {
    STDOUT,
    FILE,
}

struct Logger {
    sink: Mutex<Box<dyn Write + Send>>,
    start_instant: Instant,
}

impl Logger {
    fn new(kind: LogKind) -> Self {
        let sink: Box<dyn Write + Send> = match kind {
            LogKind::STDOUT => Box::new(io::stdout()),
            LogKind::FILE => {
                let filename = format!("satsuma-{}.log", Utc::now().timestamp());
                let path = std::env::temp_dir().join(filename);
                match File::create(&path) {
                    Ok(file) => Box::new(BufWriter::new(file)),
                    // Opening the log file is best-effort; fall back to
                    // the console rather than refusing to start.
                    Err(_) => Box::new(io::stdout()),
                }
            }
        };

        Self {
            sink: Mutex::new(sink),
            start_instant: Instant::now(),
        }
    }

    fn write_line(&self, data: impl std::fmt::Display) {
        let elapsed = self.start_instant.elapsed();
        let seconds = elapsed.as_secs();

        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(
                sink,
                "[{:02}:{:02}:{:02}.{:03}] {data}",
                seconds / 3600,
                (seconds / 60) % 60,
                seconds % 60,
                elapsed.subsec_millis()
            );
            let _ = sink.flush();
        }
    }
}

/// Installs the global logger. Later calls are ignored; the first sink
/// wins.
pub fn init_logger(kind: LogKind) {
    LOGGER.set(Logger::new(kind)).ok();
}

/// Logs one line with an elapsed-time prefix. A no-op until
/// [`init_logger`] has been called.
pub fn log(data: impl std::fmt::Display) {
    if let Some(logger) = LOGGER.get() {
        logger.write_line(data);
    }
}
