use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use opsh_core::HostKeyPolicy;

use crate::commands::{self, CommandError, single};
use crate::config::{HostsToml, Overrides, Target, resolve_targets};

const DEFAULT_HTML_DIR: &str = "/usr/share/nginx/html";

/// opsh - run diagnostics and deployments on remote hosts over SSH
#[derive(Parser)]
#[command(name = "opsh")]
#[command(version, about = "Run diagnostics and deployments on remote hosts over SSH")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Host inventory file (default: ~/.opsh/config.toml)
    #[arg(long, global = true, env = "OPSH_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Host name from config, or an address for ad-hoc use (repeatable for `check`)
    #[arg(long = "host", global = true, env = "OPSH_HOST", value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// SSH port
    #[arg(long, global = true, env = "OPSH_PORT")]
    pub port: Option<u16>,

    /// SSH user
    #[arg(long, global = true, env = "OPSH_USER")]
    pub user: Option<String>,

    /// Private key for public key authentication
    #[arg(long, global = true, env = "OPSH_IDENTITY_FILE", value_name = "PATH")]
    pub identity_file: Option<PathBuf>,

    /// Host key verification: strict, accept-new or accept-any
    #[arg(long, global = true, env = "OPSH_HOST_KEY_POLICY")]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[arg(long, global = true, env = "OPSH_KNOWN_HOSTS", value_name = "PATH")]
    pub known_hosts: Option<PathBuf>,

    /// Seconds allowed for connect, handshake and authentication
    #[arg(
        long,
        global = true,
        default_value_t = 30,
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub connect_timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command on the remote host and exit with its status
    Exec {
        /// Print output as it arrives
        #[arg(long)]
        stream: bool,

        /// Command line for the remote shell. Words are joined with spaces
        /// and split again remotely, so quote for the remote side.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a local file or directory to the remote host
    Upload {
        local: PathBuf,
        remote: String,

        /// Copy directories recursively
        #[arg(short = 'r', long)]
        recursive: bool,
    },

    /// Copy a remote file or directory to the local machine
    Download {
        remote: String,
        local: PathBuf,

        /// Copy directories recursively
        #[arg(short = 'r', long)]
        recursive: bool,
    },

    /// Upload project files and rebuild the compose stack
    Deploy {
        /// Remote app directory (default: app_dir from config)
        #[arg(long)]
        dir: Option<String>,

        /// Files and directories to upload
        #[arg(value_name = "ITEMS")]
        items: Vec<PathBuf>,
    },

    /// Show running containers, served files and container logs
    Check {
        /// Container name (default: container from config)
        #[arg(long)]
        container: Option<String>,

        /// Directory listed inside the container
        #[arg(long, default_value = DEFAULT_HTML_DIR)]
        html_dir: String,
    },

    /// Diagnose a compose service: status, files, logs and errors
    Inspect {
        /// Remote app directory (default: app_dir from config)
        #[arg(long)]
        dir: Option<String>,

        /// Compose service (default: service from config)
        #[arg(long)]
        service: Option<String>,

        /// Container name (default: container from config)
        #[arg(long)]
        container: Option<String>,

        /// Directory listed inside the container
        #[arg(long, default_value = DEFAULT_HTML_DIR)]
        html_dir: String,

        /// Number of log lines
        #[arg(long, default_value_t = 50)]
        tail: u32,
    },

    /// Open a TCP port with ufw, or iptables when ufw is inactive
    Firewall {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Show compose status and logs, then recreate all containers
    Rebuild {
        /// Remote app directory (default: app_dir from config)
        #[arg(long)]
        dir: Option<String>,

        /// Number of log lines
        #[arg(long, default_value_t = 50)]
        tail: u32,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            hosts: self.hosts.clone(),
            port: self.port,
            user: self.user.clone(),
            identity_file: self.identity_file.clone(),
            host_key_policy: self.host_key_policy,
            known_hosts: self.known_hosts.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    fn targets(&self) -> Result<Vec<Target>, CommandError> {
        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => HostsToml::default_path()?,
        };
        let inventory = HostsToml::load_or_default(&config_path)?;
        let env = |key: &str| std::env::var(key).ok();
        Ok(resolve_targets(
            &inventory,
            &config_path,
            &self.overrides(),
            &env,
        )?)
    }

    /// Run the selected command; returns the exit code for the process.
    pub fn run(self) -> Result<i32, CommandError> {
        let targets = self.targets()?;

        match self.command {
            Commands::Exec { stream, command } => {
                commands::exec::run(single(targets)?, &command, stream)
            }
            Commands::Upload {
                local,
                remote,
                recursive,
            } => commands::transfer::upload(single(targets)?, local, remote, recursive).map(|_| 0),
            Commands::Download {
                remote,
                local,
                recursive,
            } => {
                commands::transfer::download(single(targets)?, remote, local, recursive).map(|_| 0)
            }
            Commands::Deploy { dir, items } => {
                commands::deploy::run(single(targets)?, dir, items).map(|_| 0)
            }
            Commands::Check {
                container,
                html_dir,
            } => commands::check::run(targets, container, html_dir).map(|_| 0),
            Commands::Inspect {
                dir,
                service,
                container,
                html_dir,
                tail,
            } => commands::inspect::run(single(targets)?, dir, service, container, html_dir, tail)
                .map(|_| 0),
            Commands::Firewall { port } => {
                commands::firewall::run(single(targets)?, port).map(|_| 0)
            }
            Commands::Rebuild { dir, tail } => {
                commands::rebuild::run(single(targets)?, dir, tail).map(|_| 0)
            }
        }
    }
}
