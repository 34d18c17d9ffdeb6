use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("Could not find the {0} executable")]
    ExecutableNotFound(String),
    #[error("This operation requires root privileges (running as {0})")]
    PermissionDenied(String),
    #[error("Failed to call process {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Process \"{name}\" timed out after {timeout:?}")]
    Timeout {
        name: String,
        timeout: Duration,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    #[error("{0}")]
    ExitStatus(String),
    #[error("No such process: {0}")]
    NoSuchProcess(u32),
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Probe \"{probe}\" returned {actual} samples for {expected} polls")]
    SampleMismatch {
        probe: String,
        expected: usize,
        actual: usize,
    },
    #[error("Probe error: {0}")]
    Probe(String),
    #[error("Trace error: {0}")]
    Trace(#[from] polars::prelude::PolarsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Other error: {0}")]
    Other(String),
}

impl ProcError {
    /// Output captured before a timeout fired, stderr first.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            ProcError::Timeout { stdout, stderr, .. } => stderr
                .as_deref()
                .filter(|s| !s.is_empty())
                .or(stdout.as_deref().filter(|s| !s.is_empty())),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcError::Timeout { .. })
    }
}

pub type ProcResult<T> = Result<T, ProcError>;
