use crate::executor::ExecutionStatus;
use crate::input::Input;
use serde::Serialize;
use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File the default handler appends to when no handler is configured.
pub const DEFAULT_FAILURE_LOG: &str = "./forkfuzz_failures.jsonl";

/// Errors a handler may raise. These are the only errors that escape
/// [`Executor::run`](crate::executor::Executor::run): a failing handler means
/// the harness itself is misconfigured.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handler serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

/// One detected failure, as delivered to a [`Handler`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport<I: Input> {
    /// Iteration id claimed for this sample, starting at 1.
    pub sample_id: u64,
    /// Name of the suite the sample was drawn from, if known. A worker killed
    /// between iterations before running anything has no suite.
    pub suite: Option<String>,
    /// Name of the generator, if the worker got far enough to announce it.
    pub generator: Option<String>,
    /// The generated input. `None` when the worker died or the generator
    /// faulted before the input reached the supervisor.
    pub data: Option<I>,
    /// Pid of the worker process that ran the sample.
    pub worker_pid: i32,
    pub status: ExecutionStatus,
}

impl<I: Input> FailureReport<I> {
    /// MD5 hex digest of the input bytes, for deduplicating findings.
    pub fn input_hash(&self) -> Option<String> {
        self.data
            .as_ref()
            .map(|data| format!("{:x}", md5::compute(data.as_bytes())))
    }
}

/// A sink for failure reports.
///
/// Handlers are only ever called from the supervisor, one report at a time,
/// so implementations need no internal locking.
pub trait Handler<I: Input> {
    fn name(&self) -> &'static str;

    fn handle(&mut self, report: &FailureReport<I>) -> Result<(), HandlerError>;

    /// Allows downcasting to the concrete handler type.
    fn as_any(&self) -> &dyn Any;
}

/// Prints each report to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleHandler;

impl ConsoleHandler {
    pub fn new() -> Self {
        ConsoleHandler
    }
}

impl<I: Input> Handler<I> for ConsoleHandler {
    fn name(&self) -> &'static str {
        "ConsoleHandler"
    }

    fn handle(&mut self, report: &FailureReport<I>) -> Result<(), HandlerError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "\n!!! FAILURE (sample {}) !!!", report.sample_id)?;
        if let Some(suite) = &report.suite {
            writeln!(out, "  Suite: {suite}")?;
        }
        if let Some(generator) = &report.generator {
            writeln!(out, "  Generator: {generator}")?;
        }
        writeln!(out, "  Worker: {}", report.worker_pid)?;
        writeln!(out, "  Status: {}", report.status)?;
        match &report.data {
            Some(data) => writeln!(out, "  Input: {data:?}")?,
            None => writeln!(out, "  Input: <unknown>")?,
        }
        if let Some(hash) = report.input_hash() {
            writeln!(out, "  Hash: {hash}")?;
        }
        out.flush()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Serialize)]
struct FailureRecord<'a, I: Serialize> {
    sample_id: u64,
    suite: Option<&'a str>,
    generator: Option<&'a str>,
    worker_pid: i32,
    status: String,
    crash: bool,
    signal: Option<i32>,
    input_hash: Option<String>,
    data: Option<&'a I>,
}

/// Appends each report as one JSON line to a fixed file.
///
/// The file is opened in append mode on the first report, so a run that
/// finds nothing leaves no artifact behind.
#[derive(Debug)]
pub struct FileOutputHandler {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FileOutputHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of reports written by this handler.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, HandlerError> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| HandlerError::Custom("failure log writer unavailable".to_string()))
    }
}

impl Default for FileOutputHandler {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_LOG)
    }
}

impl<I: Input> Handler<I> for FileOutputHandler {
    fn name(&self) -> &'static str {
        "FileOutputHandler"
    }

    fn handle(&mut self, report: &FailureReport<I>) -> Result<(), HandlerError> {
        let record = FailureRecord {
            sample_id: report.sample_id,
            suite: report.suite.as_deref(),
            generator: report.generator.as_deref(),
            worker_pid: report.worker_pid,
            status: report.status.to_string(),
            crash: report.status.is_crash(),
            signal: report.status.signal(),
            input_hash: report.input_hash(),
            data: report.data.as_ref(),
        };
        let writer = self.writer()?;
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.written += 1;
        tracing::debug!(path = ?self.path, sample_id = report.sample_id, "failure recorded");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;

    fn report(status: ExecutionStatus) -> FailureReport<String> {
        FailureReport {
            sample_id: 3,
            suite: Some("suite".to_string()),
            generator: Some("1".to_string()),
            data: Some("a".to_string()),
            worker_pid: 4242,
            status,
        }
    }

    #[test]
    fn input_hash_is_md5_of_bytes() {
        let r = report(ExecutionStatus::Fault("boo!".to_string()));
        assert_eq!(r.input_hash(), Some(format!("{:x}", md5::compute(b"a"))));

        let unknown = FailureReport::<String> {
            data: None,
            ..r
        };
        assert_eq!(unknown.input_hash(), None);
    }

    #[test]
    fn file_handler_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let mut handler = FileOutputHandler::new(&path);

        handler
            .handle(&report(ExecutionStatus::Fault("boo!".to_string())))
            .unwrap();
        handler.handle(&report(ExecutionStatus::Signaled(11))).unwrap();
        assert_eq!(handler.written(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<JsonValue> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["sample_id"], 3);
        assert_eq!(lines[0]["data"], "a");
        assert_eq!(lines[0]["suite"], "suite");
        assert_eq!(lines[0]["crash"], false);
        assert_eq!(lines[1]["crash"], true);
        assert_eq!(lines[1]["signal"], 11);
    }

    #[test]
    fn file_handler_does_not_truncate_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        std::fs::write(&path, "{\"earlier\":true}\n").unwrap();

        let mut handler = FileOutputHandler::new(&path);
        handler
            .handle(&report(ExecutionStatus::Exited(3)))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("{\"earlier\":true}"));
    }

    #[test]
    fn file_handler_surfaces_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = FileOutputHandler::new(dir.path().join("missing").join("log.jsonl"));
        let err = handler
            .handle(&report(ExecutionStatus::Fault("x".to_string())))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Io(_)));
    }

    #[test]
    fn default_file_handler_uses_fixed_path() {
        let handler = FileOutputHandler::default();
        assert_eq!(handler.path(), Path::new(DEFAULT_FAILURE_LOG));
        assert_eq!(handler.written(), 0);
    }

    #[test]
    fn console_handler_accepts_reports() {
        let mut handler = ConsoleHandler::new();
        Handler::<String>::handle(&mut handler, &report(ExecutionStatus::Signaled(6))).unwrap();
    }
}
