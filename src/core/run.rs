/// Per-invocation run state: staging directory, journal and final outcome

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::core::error::{Error, IoContext, Result};

/// Log lines collected during one run, mirrored to tracing as they are written
#[derive(Debug, Default, Clone)]
pub struct Journal {
    lines: Vec<String>,
    warnings: Vec<String>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.lines.push(format!("[INFO] {}", message));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.lines.push(format!("[WARNING] {}", message));
        self.warnings.push(message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.lines.push(format!("[ERROR] {}", message));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Transient state of one backup or restore invocation.
///
/// The staging directory is removed when the context is dropped, whatever
/// the outcome of the run.
#[derive(Debug)]
pub struct RunContext {
    staging: TempDir,
    pub journal: Journal,
    started: Instant,
}

impl RunContext {
    pub fn new(prefix: &str) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .at_path(std::env::temp_dir())?;

        Ok(Self {
            staging,
            journal: Journal::new(),
            started: Instant::now(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Close the run; dropping the context removes the staging directory
    pub fn finish(self, success: bool, message: impl Into<String>, archive: Option<PathBuf>) -> RunOutcome {
        let Self { journal, started, .. } = self;
        RunOutcome {
            success,
            duration_secs: started.elapsed().as_secs_f64(),
            message: message.into(),
            archive,
            warnings: journal.warnings,
            log: journal.lines,
        }
    }
}

/// A step error tagged with the sequencer state it happened in
#[derive(Debug)]
pub struct StepFailure<S> {
    pub state: S,
    pub error: Error,
}

impl<S: fmt::Display> fmt::Display for StepFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed while {}: {}", self.state, self.error)
    }
}

pub trait AtState<T, S> {
    fn at_state(self, state: S) -> std::result::Result<T, StepFailure<S>>;
}

impl<T, S> AtState<T, S> for Result<T> {
    fn at_state(self, state: S) -> std::result::Result<T, StepFailure<S>> {
        self.map_err(|error| StepFailure { state, error })
    }
}

/// What the front-end sees: a success flag, a duration and a message
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub duration_secs: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub log: Vec<String>,
}

impl RunOutcome {
    /// Outcome of a run that failed before it had a context
    pub fn aborted(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("{}", message);
        Self {
            success: false,
            duration_secs: 0.0,
            log: vec![format!("[ERROR] {}", message)],
            message,
            archive: None,
            warnings: Vec::new(),
        }
    }

    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }
}
