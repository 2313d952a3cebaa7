//! SSH transport implementation using russh

use super::{ChannelEvent, Connector, ExecChannel, Transport};
use crate::endpoint::{Credential, Endpoint, HostKeyPolicy, SessionOptions};
use crate::error::{ChannelError, ConnectionError};
use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler, Msg};
use russh::keys::ssh_key::HashAlg;
use russh::keys::known_hosts::learn_known_hosts_path;
use russh::keys::{
    Algorithm, PrivateKeyWithHashAlg, PublicKey, check_known_hosts_path, load_secret_key,
};
use russh::{Channel, ChannelMsg, Disconnect};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised from inside the russh handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Host key verification failed: {0}")]
    HostKey(String),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// Handler for SSH client events
pub struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: PathBuf,
}

impl SshHandler {
    fn new(endpoint: &Endpoint, options: &SessionOptions) -> Self {
        Self {
            host: endpoint.host().to_string(),
            port: endpoint.port(),
            policy: options.host_key_policy,
            known_hosts: options.known_hosts_file(),
        }
    }

    fn verify_server_key(&self, key: &PublicKey) -> Result<bool, HandshakeError> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);

        if self.policy == HostKeyPolicy::AcceptAny {
            tracing::debug!(
                host = %self.host,
                %fingerprint,
                "Accepting server key without verification"
            );
            return Ok(true);
        }

        match check_known_hosts_path(&self.host, self.port, key, &self.known_hosts) {
            Ok(true) => {
                tracing::debug!(host = %self.host, %fingerprint, "Server key matches known_hosts");
                Ok(true)
            }
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                learn_known_hosts_path(&self.host, self.port, key, &self.known_hosts).map_err(
                    |e| {
                        HandshakeError::HostKey(format!(
                            "could not record key in {}: {}",
                            self.known_hosts.display(),
                            e
                        ))
                    },
                )?;
                tracing::warn!(
                    host = %self.host,
                    %fingerprint,
                    known_hosts = %self.known_hosts.display(),
                    "Permanently added new host key"
                );
                Ok(true)
            }
            Ok(false) => Err(HandshakeError::HostKey(format!(
                "no key for {} in {} (server offered {})",
                self.host,
                self.known_hosts.display(),
                fingerprint
            ))),
            Err(russh::keys::Error::KeyChanged { line }) => Err(HandshakeError::HostKey(format!(
                "key for {} changed (known_hosts line {}, server offered {})",
                self.host, line, fingerprint
            ))),
            Err(e) => Err(HandshakeError::HostKey(e.to_string())),
        }
    }
}

impl Handler for SshHandler {
    type Error = HandshakeError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let verdict = self.verify_server_key(server_public_key);
        async move { verdict }
    }
}

/// Opens russh connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshTransport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<SshTransport, ConnectionError> {
        let ssh_config = Config {
            inactivity_timeout: None,
            keepalive_interval: options.keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = SshHandler::new(endpoint, options);
        let addr = (endpoint.host().to_string(), endpoint.port());

        let mut handle = client::connect(Arc::new(ssh_config), addr, handler)
            .await
            .map_err(|e| match e {
                HandshakeError::HostKey(reason) => ConnectionError::AuthFailed(format!(
                    "host key verification failed: {}",
                    reason
                )),
                HandshakeError::Ssh(e) => ConnectionError::Unreachable(e.to_string()),
            })?;

        authenticate(&mut handle, endpoint).await?;

        Ok(SshTransport { handle })
    }
}

async fn authenticate(
    handle: &mut Handle<SshHandler>,
    endpoint: &Endpoint,
) -> Result<(), ConnectionError> {
    let user = endpoint.username();

    let accepted = match endpoint.credential() {
        Credential::Password(secret) => {
            tracing::debug!(user, "Trying password authentication");
            handle
                .authenticate_password(user, secret.expose())
                .await
                .map_err(|e| ConnectionError::Unreachable(e.to_string()))?
                .success()
        }
        Credential::PrivateKey { path, passphrase } => {
            tracing::debug!(user, key = %path.display(), "Trying public key authentication");
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose())).map_err(
                |e| {
                    ConnectionError::AuthFailed(format!(
                        "failed to load key {}: {}",
                        path.display(),
                        e
                    ))
                },
            )?;

            let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| ConnectionError::Unreachable(e.to_string()))?
                    .flatten()
            } else {
                None
            };

            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(|e| ConnectionError::Unreachable(e.to_string()))?
                .success()
        }
    };

    if accepted {
        Ok(())
    } else {
        Err(ConnectionError::AuthFailed(format!(
            "server rejected {} credentials for user '{}'",
            endpoint.credential().kind(),
            user
        )))
    }
}

/// An authenticated russh connection.
pub struct SshTransport {
    handle: Handle<SshHandler>,
}

impl SshTransport {
    fn classify(&self, e: russh::Error) -> ChannelError {
        if self.handle.is_closed() {
            ChannelError::Closed
        } else {
            ChannelError::Rejected(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.classify(e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(Box::new(SshExecChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

struct SshExecChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ChannelEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { data, ext } => {
                    // ext 1 is stderr; no other extended streams are defined
                    if ext == 1 {
                        return Some(ChannelEvent::Stderr(data.to_vec()));
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ChannelEvent::ExitStatus(exit_status));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Some(ChannelEvent::ExitSignal(format!("{:?}", signal_name)));
                }
                ChannelMsg::Eof => return Some(ChannelEvent::Eof),
                ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), ChannelError> {
        self.channel.eof().await?;
        Ok(())
    }
}
