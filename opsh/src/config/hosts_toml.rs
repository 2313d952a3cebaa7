use opsh_core::HostKeyPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ConfigError, Result};

/// Host inventory from ~/.opsh/config.toml `[[hosts]]`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HostsToml {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// Single host entry with SSH connection details and app defaults
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: String,

    /// Private key used for public key authentication
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Name of the environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,

    #[serde(default)]
    pub host_key_policy: Option<String>,

    /// Remote directory holding docker-compose.yml
    #[serde(default)]
    pub app_dir: Option<String>,

    /// docker-compose service name
    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub container: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostEntry {
    pub fn policy(&self) -> Result<Option<HostKeyPolicy>> {
        self.host_key_policy
            .as_deref()
            .map(|value| {
                value.parse::<HostKeyPolicy>().map_err(|e| {
                    ConfigError::Validation(format!("Host '{}': {}", self.name, e))
                })
            })
            .transpose()
    }
}

impl HostsToml {
    /// Get the default path for the config (~/.opsh/config.toml).
    pub fn default_path() -> Result<PathBuf> {
        let home = crate::paths::opsh_home_dir().map_err(|e| {
            ConfigError::Validation(format!("Could not determine opsh home directory: {}", e))
        })?;
        Ok(home.join("config.toml"))
    }

    /// Load the inventory at `path`; a missing file is an empty inventory.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        tracing::debug!(path = %path.display(), "No host inventory, using flags only");
        Ok(Self::default())
    }

    /// Load host inventory from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        let inventory = Self::parse(&content)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            hosts = inventory.len(),
            "Loaded host inventory"
        );
        Ok(inventory)
    }

    /// Parse host inventory TOML (`[[hosts]]` array).
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: toml::Value = toml::from_str(content)?;
        if let Some(hosts) = raw.get("hosts").and_then(|v| v.as_array()) {
            for host in hosts {
                if host.get("password").is_some() {
                    let name = host.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                    return Err(ConfigError::Validation(format!(
                        "Host '{}' sets 'password'. Passwords are not stored in config; set password_env to the name of an environment variable instead",
                        name
                    )));
                }
            }
        }

        let config: HostsToml = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.hosts {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Host entry must have a non-empty 'name'".to_string(),
                ));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateHostName(entry.name.clone()));
            }
            if entry.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "Host '{}' has invalid port 0",
                    entry.name
                )));
            }
            if entry.identity_file.is_some() && entry.password_env.is_some() {
                return Err(ConfigError::Validation(format!(
                    "Host '{}' sets both identity_file and password_env; choose one",
                    entry.name
                )));
            }
            entry.policy()?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}
