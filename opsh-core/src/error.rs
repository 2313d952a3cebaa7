//! Session error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a session could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    AuthFailed,
    Unreachable,
    Timeout,
}

/// Errors returned by [`crate::RemoteSession::open`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectionError {
    pub fn reason(&self) -> ConnectFailure {
        match self {
            ConnectionError::AuthFailed(_) => ConnectFailure::AuthFailed,
            ConnectionError::Unreachable(_) => ConnectFailure::Unreachable,
            ConnectionError::Timeout(_) => ConnectFailure::Timeout,
        }
    }
}

/// Errors returned by `run` and `run_streaming`.
///
/// A non-zero remote exit status is not an error; it is reported in
/// [`crate::CommandResult::exit_status`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Server rejected the command channel: {0}")]
    ChannelRejected(String),
}

/// Errors returned by `upload` and `download`.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Local path not found: {0}")]
    LocalPathMissing(PathBuf),

    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("Remote write denied: {0}")]
    RemoteWriteDenied(String),

    #[error("Remote read failed: {0}")]
    RemoteReadFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Local I/O error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer protocol error: {0}")]
    Protocol(String),
}

/// Invalid endpoint fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Host '{0}' must not contain whitespace")]
    InvalidHost(String),

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Username must not be empty")]
    EmptyUsername,
}

/// Low-level fault reported by a transport or one of its channels.
///
/// The session classifies these into the public error types.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Transport closed")]
    Closed,

    #[error("Channel request rejected: {0}")]
    Rejected(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl From<russh::Error> for ChannelError {
    fn from(e: russh::Error) -> Self {
        ChannelError::Protocol(e.to_string())
    }
}
