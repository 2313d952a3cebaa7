mod cli;
mod commands;
mod config;
mod output;
mod paths;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() {
    // Parse CLI arguments early so we can configure logging/output.
    let cli = Cli::parse();

    crate::output::set_verbose(cli.verbose);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("info")
            } else {
                EnvFilter::new("warn")
            }
        }))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            crate::output::error_stderr(&e.to_string());
            std::process::exit(1);
        }
    }
}
