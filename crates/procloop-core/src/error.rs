//! Error types for procloop.
//!
//! Launch failures are returned synchronously from the spawn call. Everything
//! that goes wrong after a process is registered with a worker is delivered
//! to the listener's `on_error` instead, so the same enum serves both paths.

use crate::builder::IoMode;
use crate::process::Stream;
use thiserror::Error;

/// Main error type for the procloop engine.
#[derive(Debug, Error)]
pub enum ProcloopError {
    // Launch errors
    #[error("Failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty command line")]
    EmptyCommand,

    #[error("I/O mode {0:?} is not supported by the non-blocking engine")]
    UnsupportedIoMode(IoMode),

    #[error("Effective user error: {message}")]
    EffectiveUser { message: String },

    // Runtime stream errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{stream} stream failed: {source}")]
    Stream {
        stream: Stream,
        #[source]
        source: std::io::Error,
    },

    #[error("stdin is closed or closing")]
    StdinClosed,

    #[error("{stream} buffer is full and the listener consumed nothing")]
    BufferNotDrained { stream: Stream },

    #[error("Listener panicked in {callback}: {message}")]
    ListenerPanicked {
        callback: &'static str,
        message: String,
    },

    // Process state errors
    #[error("Process {pid} is still running")]
    StillRunning { pid: u32 },

    // Pool errors
    #[error("Process pool has been shut down")]
    PoolShutdown,

    #[error("Event loop of worker {index} failed: {message}")]
    WorkerFailed { index: usize, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for procloop operations.
pub type Result<T> = std::result::Result<T, ProcloopError>;

impl From<std::io::Error> for ProcloopError {
    fn from(err: std::io::Error) -> Self {
        ProcloopError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProcloopError {
    fn from(err: serde_json::Error) -> Self {
        ProcloopError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for ProcloopError {
    fn from(err: nix::errno::Errno) -> Self {
        ProcloopError::from(std::io::Error::from(err))
    }
}

impl ProcloopError {
    /// Wrap a spawn-time OS error with the command that failed.
    pub fn launch(command: impl Into<String>, source: std::io::Error) -> Self {
        ProcloopError::Launch {
            command: command.into(),
            source,
        }
    }

    /// True for errors that prevented the child from ever running.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            ProcloopError::Launch { .. }
                | ProcloopError::EmptyCommand
                | ProcloopError::UnsupportedIoMode(_)
                | ProcloopError::EffectiveUser { .. }
                | ProcloopError::PoolShutdown
        )
    }

    /// True when the underlying OS error is "not found" (missing executable).
    pub fn is_not_found(&self) -> bool {
        match self {
            ProcloopError::Launch { source, .. } | ProcloopError::Stream { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            ProcloopError::Io {
                source: Some(source),
                ..
            } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
