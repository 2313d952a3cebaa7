use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate host name: {0}")]
    DuplicateHostName(String),

    #[error("No host selected. Pass --host or add a [[hosts]] entry to {0}")]
    NoHost(PathBuf),

    #[error(
        "No host key policy for '{0}'. Set host_key_policy in config or pass --host-key-policy (strict, accept-new, accept-any)"
    )]
    MissingHostKeyPolicy(String),

    #[error(
        "No credential for '{0}'. Set identity_file or password_env in config, or export OPSH_IDENTITY_FILE or OPSH_PASSWORD"
    )]
    MissingCredential(String),

    #[error("Invalid endpoint for '{0}': {1}")]
    Endpoint(String, opsh_core::EndpointError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
