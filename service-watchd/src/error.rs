//! Error types for the discovery engine

use std::fmt;
use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Classification of errors reported by a discovery backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The backend (or its transport) cannot be reached at all
    BackendUnreachable,

    /// The supporting daemon is installed but not running
    DaemonNotRunning,

    /// The operation is not implemented by this backend
    Unsupported,

    /// The query did not produce an answer in time
    Timeout,

    /// Name already in use
    NameConflict,

    /// Malformed request or reply
    Invalid,

    /// The backend cannot continue
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BackendUnreachable => "backend unreachable",
            ErrorKind::DaemonNotRunning => "daemon not running",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NameConflict => "name conflict",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Error returned by a backend call or delivered in a backend reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnreachable, message)
    }

    pub fn daemon_not_running(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DaemonNotRunning, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// Errors after which the backend should not be used again
    pub fn disables_backend(&self) -> bool {
        matches!(self.kind, ErrorKind::Unsupported | ErrorKind::Fatal)
    }
}

/// Errors surfaced by the public discovery API
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The shared connection is stopping or already stopped
    #[error("discovery connection is stopping or stopped")]
    ConnectionStopped,

    /// `stop` was invoked on the connection's own worker thread
    #[error("connection cannot be stopped from its own worker thread")]
    StopFromWorker,

    #[error("failed to spawn connection worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("unknown service: {0}")]
    UnknownService(String),
}
