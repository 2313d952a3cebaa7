//! Remote command execution, output streaming and file transfer over SSH.
//!
//! ```no_run
//! use opsh_core::{Credential, Endpoint, HostKeyPolicy, RemoteSession, Secret, SessionOptions};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let password = std::env::var("OPSH_PASSWORD")?;
//! let endpoint = Endpoint::new("203.0.113.5", 22, "root", Credential::Password(Secret::new(password)))?;
//! let session = RemoteSession::open(endpoint, SessionOptions::new(HostKeyPolicy::AcceptNew)).await?;
//!
//! let result = session.run("docker ps").await?;
//! print!("{}", result.stdout_lossy());
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod endpoint;
pub mod error;
pub mod scp;
pub mod session;
pub mod transport;

pub use command::{RemoteCommand, shell_quote};
pub use endpoint::{Credential, Endpoint, HostKeyPolicy, Secret, SessionOptions};
pub use error::{ConnectFailure, ConnectionError, EndpointError, ExecutionError, TransferError};
pub use scp::{TransferRequest, TransferSummary};
pub use session::{CommandResult, OutputStream, RemoteSession, SessionState};
