//! Remote command execution and file transfer session
//!
//! A [`RemoteSession`] owns one authenticated connection. Every command gets a
//! fresh exec channel; nothing (working directory, environment) persists
//! between calls. Operations on one session are serialized. [`RemoteSession::close`]
//! may be called from another task while an operation is in flight and makes
//! that operation fail promptly.

use crate::endpoint::{Endpoint, SessionOptions};
use crate::error::{ChannelError, ConnectionError, ExecutionError, TransferError};
use crate::scp::{self, TransferRequest, TransferSummary};
use crate::transport::ssh::{SshConnector, SshTransport};
use crate::transport::{ChannelEvent, Connector, Transport};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which remote stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    exit_status: Option<i32>,
    exit_signal: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandResult {
    /// Remote exit status; `None` if the process was killed by a signal or the
    /// server never reported one.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn exit_signal(&self) -> Option<&str> {
        self.exit_signal.as_deref()
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let stdout = self.stdout_lossy();
        let stderr = self.stderr_lossy();
        if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{}\n{}", stdout.trim_end_matches('\n'), stderr)
        }
    }
}

/// An authenticated remote session.
pub struct RemoteSession<T: Transport = SshTransport> {
    endpoint: Endpoint,
    options: SessionOptions,
    transport: T,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    ops: tokio::sync::Mutex<()>,
}

impl RemoteSession<SshTransport> {
    /// Connect and authenticate over SSH.
    pub async fn open(
        endpoint: Endpoint,
        options: SessionOptions,
    ) -> Result<Self, ConnectionError> {
        Self::open_with(&SshConnector, endpoint, options).await
    }
}

impl<T: Transport> RemoteSession<T> {
    /// Connect through `connector`, bounded by `options.connect_timeout`.
    pub async fn open_with<C>(
        connector: &C,
        endpoint: Endpoint,
        options: SessionOptions,
    ) -> Result<Self, ConnectionError>
    where
        C: Connector<Transport = T>,
    {
        tracing::debug!(
            endpoint = %endpoint,
            policy = %options.host_key_policy,
            state = %SessionState::Connecting,
            "Connecting"
        );

        let connecting = connector.connect(&endpoint, &options);
        let transport = match tokio::time::timeout(options.connect_timeout, connecting).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "Connection failed");
                return Err(e);
            }
            Err(_) => {
                tracing::debug!(endpoint = %endpoint, "Connection timed out");
                return Err(ConnectionError::Timeout(options.connect_timeout));
            }
        };

        tracing::info!(endpoint = %endpoint, "Session established");

        Ok(Self {
            endpoint,
            options,
            transport,
            state: Mutex::new(SessionState::Open),
            shutdown: CancellationToken::new(),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_failed(&self) {
        let mut state = self.lock_state();
        if *state == SessionState::Open {
            *state = SessionState::Failed;
            tracing::warn!(endpoint = %self.endpoint, "Connection lost");
        }
    }

    /// Wait for exclusive use of the session.
    async fn begin(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = tokio::select! {
            guard = self.ops.lock() => guard,
            _ = self.shutdown.cancelled() => return None,
        };
        self.is_open().then_some(guard)
    }

    fn classify_exec(&self, e: ChannelError) -> ExecutionError {
        match e {
            ChannelError::Rejected(reason) => ExecutionError::ChannelRejected(reason),
            ChannelError::Protocol(reason) if !self.transport.is_closed() => {
                ExecutionError::ChannelRejected(reason)
            }
            other => {
                self.mark_failed();
                ExecutionError::ConnectionLost(other.to_string())
            }
        }
    }

    /// Run `command` and collect its output.
    pub async fn run(&self, command: impl AsRef<str>) -> Result<CommandResult, ExecutionError> {
        self.run_streaming(command, |_, _| {}).await
    }

    /// Run `command`, handing every output chunk to `on_chunk` as it arrives.
    ///
    /// The returned result holds the concatenation of all chunks per stream.
    pub async fn run_streaming<F>(
        &self,
        command: impl AsRef<str>,
        mut on_chunk: F,
    ) -> Result<CommandResult, ExecutionError>
    where
        F: FnMut(OutputStream, &[u8]) + Send,
    {
        let command = command.as_ref();
        if !self.is_open() {
            return Err(ExecutionError::NotConnected);
        }
        let Some(_guard) = self.begin().await else {
            return Err(ExecutionError::NotConnected);
        };

        tracing::debug!(endpoint = %self.endpoint, command = %command, "Executing command");

        let opened = tokio::select! {
            res = self.transport.exec(command) => res,
            _ = self.shutdown.cancelled() => return Err(closed_in_flight()),
        };
        let mut channel = opened.map_err(|e| self.classify_exec(e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        let mut exit_signal = None;

        loop {
            let event = tokio::select! {
                event = channel.recv() => event,
                _ = self.shutdown.cancelled() => return Err(closed_in_flight()),
            };

            match event {
                Some(ChannelEvent::Stdout(data)) => {
                    on_chunk(OutputStream::Stdout, &data);
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelEvent::Stderr(data)) => {
                    on_chunk(OutputStream::Stderr, &data);
                    stderr.extend_from_slice(&data);
                }
                Some(ChannelEvent::ExitStatus(code)) => exit_status = Some(code),
                Some(ChannelEvent::ExitSignal(signal)) => exit_signal = Some(signal),
                Some(ChannelEvent::Eof) => {}
                None => break,
            }
        }

        if exit_status.is_none() && exit_signal.is_none() && self.transport.is_closed() {
            self.mark_failed();
            return Err(ExecutionError::ConnectionLost(
                "connection dropped before the command finished".to_string(),
            ));
        }

        let result = CommandResult {
            exit_status: exit_status.and_then(|code| i32::try_from(code).ok()),
            exit_signal,
            stdout,
            stderr,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            exit_status = ?result.exit_status,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Command finished"
        );

        Ok(result)
    }

    /// Copy a local file (or tree, if `request.recursive`) to the remote host.
    pub async fn upload(&self, request: &TransferRequest) -> Result<TransferSummary, TransferError> {
        self.upload_with_progress(request, |_, _| {}).await
    }

    /// Like [`RemoteSession::upload`], reporting `(bytes_done, bytes_total)`.
    pub async fn upload_with_progress<P>(
        &self,
        request: &TransferRequest,
        progress: P,
    ) -> Result<TransferSummary, TransferError>
    where
        P: FnMut(u64, u64) + Send,
    {
        request.validate()?;
        if !self.is_open() {
            return Err(TransferError::NotConnected);
        }
        let Some(_guard) = self.begin().await else {
            return Err(TransferError::NotConnected);
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            local = %request.local_path.display(),
            remote = %request.remote_path,
            recursive = request.recursive,
            "Uploading"
        );

        let result = scp::upload(&self.transport, &self.shutdown, request, progress).await;
        self.settle_transfer(result)
    }

    /// Copy a remote file (or tree, if `recursive`) to `local_path`.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<TransferSummary, TransferError> {
        let local_path = local_path.as_ref();
        if !self.is_open() {
            return Err(TransferError::NotConnected);
        }
        let Some(_guard) = self.begin().await else {
            return Err(TransferError::NotConnected);
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            remote = %remote_path,
            local = %local_path.display(),
            recursive,
            "Downloading"
        );

        let result = scp::download(
            &self.transport,
            &self.shutdown,
            remote_path,
            local_path,
            recursive,
        )
        .await;
        self.settle_transfer(result)
    }

    fn settle_transfer(
        &self,
        result: Result<TransferSummary, TransferError>,
    ) -> Result<TransferSummary, TransferError> {
        if let Err(TransferError::ConnectionLost(_)) = &result
            && self.transport.is_closed()
        {
            self.mark_failed();
        }
        result
    }

    /// Release the connection. Safe to call more than once and from another
    /// task while an operation is running; that operation fails promptly.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }

        self.shutdown.cancel();

        match tokio::time::timeout(self.options.connect_timeout, self.transport.disconnect()).await
        {
            Ok(Ok(())) => tracing::info!(endpoint = %self.endpoint, "Session closed"),
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Disconnect failed")
            }
            Err(_) => tracing::warn!(endpoint = %self.endpoint, "Timed out sending disconnect"),
        }
    }
}

impl<T: Transport> Drop for RemoteSession<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T: Transport> fmt::Debug for RemoteSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

fn closed_in_flight() -> ExecutionError {
    ExecutionError::ConnectionLost("session closed while the command was running".to_string())
}
