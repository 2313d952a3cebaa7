mod error;
mod hosts_toml;
mod target;

pub use error::*;
pub use hosts_toml::*;
pub use target::*;
