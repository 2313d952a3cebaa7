//! Connection targets and session options

use crate::error::EndpointError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A secret string (password or key passphrase).
///
/// `Debug` and `Display` never reveal the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// How the client proves its identity. Exactly one per endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(Secret),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<Secret>,
    },
}

impl Credential {
    /// Short label for logs. Never includes the secret itself.
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "publickey",
        }
    }
}

/// Address and credential identifying a remote target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    username: String,
    credential: Credential,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: Credential,
    ) -> Result<Self, EndpointError> {
        let host = host.into();
        let username = username.into();

        if host.trim().is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        if host.chars().any(char::is_whitespace) {
            return Err(EndpointError::InvalidHost(host));
        }
        if port == 0 {
            return Err(EndpointError::InvalidPort);
        }
        if username.trim().is_empty() {
            return Err(EndpointError::EmptyUsername);
        }

        Ok(Self {
            host,
            port,
            username,
            credential,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.address())
    }
}

/// Host identity verification policy.
///
/// There is no default: callers must pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// The server key must already be in the known_hosts file.
    Strict,
    /// Unknown hosts are added to known_hosts; changed keys are rejected.
    AcceptNew,
    /// Any server key is accepted. Insecure.
    AcceptAny,
}

impl HostKeyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "strict",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::AcceptAny => "accept-any",
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "yes" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "tofu" => Ok(HostKeyPolicy::AcceptNew),
            "accept-any" | "no" | "off" => Ok(HostKeyPolicy::AcceptAny),
            other => Err(format!(
                "Unknown host key policy '{}' (expected strict, accept-new or accept-any)",
                other
            )),
        }
    }
}

/// Options applied when opening a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host_key_policy: HostKeyPolicy,
    /// known_hosts file (default ~/.ssh/known_hosts)
    pub known_hosts_path: Option<PathBuf>,
    /// Bounds TCP connect, handshake and authentication
    pub connect_timeout: Duration,
    /// Keepalive interval; three missed replies fail the transport
    pub keepalive_interval: Option<Duration>,
}

impl SessionOptions {
    pub fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self {
            host_key_policy,
            known_hosts_path: None,
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(15)),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_known_hosts(mut self, path: impl AsRef<Path>) -> Self {
        self.known_hosts_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Get the known_hosts file path
    pub fn known_hosts_file(&self) -> PathBuf {
        self.known_hosts_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("known_hosts")
        })
    }
}
