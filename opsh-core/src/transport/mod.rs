//! Transport seam between [`crate::RemoteSession`] and the wire.
//!
//! A [`Connector`] produces an authenticated [`Transport`]; a transport opens
//! one [`ExecChannel`] per remote command. The production implementation is
//! [`ssh::SshConnector`] on top of russh.

use crate::endpoint::{Endpoint, SessionOptions};
use crate::error::{ChannelError, ConnectionError};
use async_trait::async_trait;

#[cfg(test)]
pub(crate) mod mock;
pub mod ssh;

/// One message received on an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
}

/// Establishes authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Self::Transport, ConnectionError>;
}

/// An authenticated connection able to run remote commands.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session channel and start `command` on it.
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError>;

    /// Whether the underlying connection has gone away.
    fn is_closed(&self) -> bool;

    async fn disconnect(&self) -> Result<(), ChannelError>;
}

/// A running remote command.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next event, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<ChannelEvent>;

    /// Write to the remote command's stdin.
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Signal end of stdin.
    async fn send_eof(&mut self) -> Result<(), ChannelError>;
}
