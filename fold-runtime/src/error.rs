use std::path::PathBuf;

use thiserror::Error;

use crate::transport::frame::FrameError;

/// Errors mapping between HTTP-shaped values and wire messages.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid http method: {0}")]
    InvalidMethod(String),

    #[error("status code {0} is outside 100..=599")]
    InvalidStatus(i32),

    #[error("content length {declared} does not match body length {actual}")]
    ContentLengthMismatch { declared: i64, actual: usize },
}

/// Errors surfaced by the ingress client.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to dial worker socket {addr} after {attempts} attempts: {source}")]
    DialFailed {
        addr: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("ingress client is not connected")]
    NotConnected,

    #[error("ingress call cancelled")]
    Cancelled,

    #[error("ingress call timed out")]
    Timeout,

    #[error("worker returned an error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl IngressError {
    /// True when the failure happened on the channel rather than while
    /// encoding or decoding a message.
    pub fn is_transport_failure(&self) -> bool {
        !matches!(self, IngressError::Transport(_))
    }
}

/// Errors surfaced by a worker supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process terminated by signal {0}")]
    TerminatedBySignal(i32),

    #[error("process crashed with exit code {code:?}")]
    Crashed { code: Option<i32> },

    #[error("process is not running")]
    NotRunning,

    #[error("supervisor has already been started")]
    AlreadyStarted,

    #[error("failed to deliver signal: {0}")]
    Signal(#[from] nix::Error),

    #[error("I/O error while waiting on process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Error surface for the runtime engine and the host wiring around it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("worker socket {path} is already in use")]
    SocketInUse { path: PathBuf },

    #[error("worker crashed: {0}")]
    Crashed(String),

    #[error("http server error: {0}")]
    Http(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RuntimeError {
    RuntimeError::Io {
        path: path.into(),
        source,
    }
}
