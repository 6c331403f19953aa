//! Client-side problem reporting.
//!
//! Failures that do not abort a batch still have to reach someone. A [`Reporter`] is chosen
//! once per client: when reports are suppressed nobody is watching the terminal, so problems
//! go to the configured log file instead.
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use log::error;

use crate::config::ClientConfig;

/// Sink for recoverable warnings and submission-level errors.
pub trait Reporter {
    fn warn(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn warn_line(message: &str) -> String {
    format!("{} {message} <WARN>", timestamp())
}

fn error_line(message: &str) -> String {
    format!("{} {message}", timestamp())
}

/// Appends reported lines to a debug log file.
#[derive(Debug, Clone)]
pub struct FileReporter {
    path: PathBuf,
}

impl FileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, line: &str) {
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(e) = res {
            error!("failed to write to {}: {e}; dropped: {line}", self.path.display());
        }
    }
}

impl Reporter for FileReporter {
    fn warn(&mut self, message: &str) {
        self.append(&warn_line(message));
    }

    fn error(&mut self, message: &str) {
        self.append(&error_line(message));
    }
}

/// Emits reported lines straight to the caller.
pub struct ConsoleReporter<W: Write> {
    writer: W,
}

impl ConsoleReporter<io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            writer: io::stderr(),
        }
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(&mut self, line: &str) {
        if let Err(e) = writeln!(self.writer, "{line}").and_then(|_| self.writer.flush()) {
            error!("failed to emit report line: {e}; dropped: {line}");
        }
    }
}

impl<W: Write> Reporter for ConsoleReporter<W> {
    fn warn(&mut self, message: &str) {
        self.emit(&warn_line(message));
    }

    fn error(&mut self, message: &str) {
        self.emit(&error_line(message));
    }
}

/// Keeps reported messages in memory for embedding callers.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Reporter for MemoryReporter {
    fn warn(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    fn error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

/// Picks the file reporter when reports are suppressed, the console otherwise.
pub fn reporter_for(config: &ClientConfig, suppress_report: bool) -> Box<dyn Reporter> {
    if suppress_report {
        Box::new(FileReporter::new(&config.client.log_file))
    } else {
        Box::new(ConsoleReporter::stderr())
    }
}
