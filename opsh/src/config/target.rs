use opsh_core::{
    ConnectionError, Credential, Endpoint, HostKeyPolicy, RemoteSession, Secret, SessionOptions,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ConfigError, Result};
use super::hosts_toml::{HostEntry, HostsToml};
use crate::paths::expand_home;

/// Connection settings given as global flags or `OPSH_*` variables.
#[derive(Debug, Clone)]
pub struct Overrides {
    pub hosts: Vec<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: None,
            user: None,
            identity_file: None,
            host_key_policy: None,
            known_hosts: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// A fully resolved host to connect to.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub endpoint: Endpoint,
    pub options: SessionOptions,
    pub app_dir: Option<String>,
    pub service: Option<String>,
    pub container: Option<String>,
}

impl Target {
    pub async fn connect(&self) -> std::result::Result<RemoteSession, ConnectionError> {
        tracing::debug!(
            host = %self.name,
            auth = self.endpoint.credential().kind(),
            policy = %self.options.host_key_policy,
            "Opening session"
        );
        RemoteSession::open(self.endpoint.clone(), self.options.clone()).await
    }
}

/// Resolve the hosts selected by `overrides` against the inventory.
///
/// `--host` values naming an inventory entry use that entry; anything else is
/// an ad-hoc host that needs `--user`. Without `--host`, a single configured
/// host is selected implicitly.
pub fn resolve_targets(
    inventory: &HostsToml,
    config_path: &Path,
    overrides: &Overrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<Target>> {
    let names: Vec<String> = if !overrides.hosts.is_empty() {
        overrides.hosts.clone()
    } else if inventory.len() == 1 {
        inventory.names().into_iter().map(str::to_string).collect()
    } else if inventory.is_empty() {
        return Err(ConfigError::NoHost(config_path.to_path_buf()));
    } else {
        return Err(ConfigError::Validation(format!(
            "Several hosts configured ({}); pick one with --host",
            inventory.names().join(", ")
        )));
    };

    names
        .iter()
        .map(|name| match inventory.get(name) {
            Some(entry) => resolve_entry(entry, overrides, env),
            None => resolve_adhoc(name, overrides, env),
        })
        .collect()
}

fn session_options(policy: HostKeyPolicy, overrides: &Overrides) -> SessionOptions {
    let options = SessionOptions::new(policy).with_connect_timeout(overrides.connect_timeout);
    match &overrides.known_hosts {
        Some(path) => options.with_known_hosts(expand_home(path)),
        None => options,
    }
}

fn resolve_entry(
    entry: &HostEntry,
    overrides: &Overrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Target> {
    let policy = match overrides.host_key_policy {
        Some(policy) => policy,
        None => entry
            .policy()?
            .ok_or_else(|| ConfigError::MissingHostKeyPolicy(entry.name.clone()))?,
    };

    let identity_file = overrides
        .identity_file
        .clone()
        .or_else(|| entry.identity_file.clone());
    let credential = credential(
        &entry.name,
        identity_file,
        entry.password_env.as_deref(),
        env,
    )?;

    let endpoint = Endpoint::new(
        entry.host.clone(),
        overrides.port.unwrap_or(entry.port),
        overrides.user.clone().unwrap_or_else(|| entry.user.clone()),
        credential,
    )
    .map_err(|e| ConfigError::Endpoint(entry.name.clone(), e))?;

    Ok(Target {
        name: entry.name.clone(),
        endpoint,
        options: session_options(policy, overrides),
        app_dir: entry.app_dir.clone(),
        service: entry.service.clone(),
        container: entry.container.clone(),
    })
}

fn resolve_adhoc(
    host: &str,
    overrides: &Overrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Target> {
    let user = overrides.user.clone().ok_or_else(|| {
        ConfigError::Validation(format!(
            "Host '{}' is not in config; pass --user or set OPSH_USER",
            host
        ))
    })?;
    let policy = overrides
        .host_key_policy
        .ok_or_else(|| ConfigError::MissingHostKeyPolicy(host.to_string()))?;
    let credential = credential(host, overrides.identity_file.clone(), None, env)?;

    let endpoint = Endpoint::new(host, overrides.port.unwrap_or(22), user, credential)
        .map_err(|e| ConfigError::Endpoint(host.to_string(), e))?;

    Ok(Target {
        name: host.to_string(),
        endpoint,
        options: session_options(policy, overrides),
        app_dir: None,
        service: None,
        container: None,
    })
}

fn credential(
    name: &str,
    identity_file: Option<PathBuf>,
    password_env: Option<&str>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Credential> {
    let non_empty = |key: &str| env(key).filter(|v| !v.is_empty());

    if let Some(path) = identity_file {
        return Ok(Credential::PrivateKey {
            path: expand_home(&path),
            passphrase: non_empty("OPSH_KEY_PASSPHRASE").map(Secret::new),
        });
    }

    if let Some(var) = password_env {
        return non_empty(var)
            .map(|password| Credential::Password(Secret::new(password)))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "Environment variable {} (password_env for '{}') is not set",
                    var, name
                ))
            });
    }

    non_empty("OPSH_PASSWORD")
        .map(|password| Credential::Password(Secret::new(password)))
        .ok_or_else(|| ConfigError::MissingCredential(name.to_string()))
}
