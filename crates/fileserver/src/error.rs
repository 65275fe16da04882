//! Error types for serving, tunneling and session supervision

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Why a path was rejected as the file to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFileReason {
    /// Nothing exists at the path
    Missing,
    /// The path exists but is a directory or special file
    NotRegularFile,
    /// The file exists but could not be opened for reading
    Unreadable(io::ErrorKind),
}

impl fmt::Display for InvalidFileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidFileReason::Missing => write!(f, "file not found"),
            InvalidFileReason::NotRegularFile => write!(f, "not a regular file"),
            InvalidFileReason::Unreadable(kind) => write!(f, "file is not readable ({})", kind),
        }
    }
}

/// Errors raised while starting or running the file server
#[derive(Debug, Error)]
pub enum ServeError {
    /// The designated file cannot be served
    #[error("{reason}: {}", .path.display())]
    InvalidFile {
        path: PathBuf,
        reason: InvalidFileReason,
    },

    /// The listening socket could not be bound
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The background runtime could not be created
    #[error("failed to build server runtime: {0}")]
    Runtime(#[source] io::Error),

    /// The background thread could not be spawned
    #[error("failed to spawn server thread: {0}")]
    Spawn(#[source] io::Error),

    /// The background unit died before reporting readiness
    #[error("file server exited before it was ready")]
    Crashed,
}

impl ServeError {
    pub fn is_invalid_file(&self) -> bool {
        matches!(self, ServeError::InvalidFile { .. })
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, ServeError::Bind { .. })
    }
}

/// A read failure while answering a single download request.
///
/// Never escapes the request handler: it is logged and turned into a
/// 500 response (or an aborted body when streaming already started).
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct RequestIoError {
    pub stage: &'static str,
    #[source]
    pub source: io::Error,
}

impl RequestIoError {
    pub fn new(stage: &'static str, source: io::Error) -> Self {
        Self { stage, source }
    }
}

/// Errors raised by tunnel clients
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The helper binary for a provider is not installed
    #[error("{program} not found. {hint}")]
    MissingBinary {
        program: String,
        hint: &'static str,
    },

    /// The helper process could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The helper process ended with a failure status
    #[error("{provider} tunnel exited with {status}")]
    Exited {
        provider: String,
        status: ExitStatus,
    },

    /// Connecting or negotiating with the tunnel service failed
    #[error("{0}")]
    Connect(String),

    /// SSH transport error
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error while supervising the tunnel
    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Phase of a session in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Validation,
    Start,
    Tunnel,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Validation => write!(f, "pre-start validation"),
            SessionPhase::Start => write!(f, "server start"),
            SessionPhase::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Terminal errors of a supervised session
#[derive(Debug, Error)]
pub enum SessionError {
    /// The file failed validation before anything was spawned
    #[error("pre-start validation failed: {0}")]
    Validation(#[source] ServeError),

    /// The file server could not be launched (bind failure and friends)
    #[error("file server failed to start: {0}")]
    Start(#[source] ServeError),

    /// The tunnel ended abnormally; reported after cleanup
    #[error("tunnel failed: {0}")]
    Tunnel(#[source] TunnelError),

    /// The file server unit stopped while the session was still running
    #[error("file server exited unexpectedly")]
    ServerExited,

    /// This supervisor already ran a session
    #[error("session already finished, a new supervisor is required")]
    Finished,
}

impl SessionError {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionError::Validation(_) | SessionError::Finished => SessionPhase::Validation,
            SessionError::Start(_) | SessionError::ServerExited => SessionPhase::Start,
            SessionError::Tunnel(_) => SessionPhase::Tunnel,
        }
    }
}
