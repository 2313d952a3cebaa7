use std::io::Write;

use super::{CommandError, connect, describe_exit};
use crate::config::Target;
use crate::output;

/// Run one command; returns the process exit code for opsh itself.
pub fn run(target: Target, command: &[String], stream: bool) -> Result<i32, CommandError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(target, command_line(command), stream))
}

/// Join argv words with spaces, as `ssh host cmd...` does. The remote shell
/// splits the line again, so quoting must be written for the remote side
/// (`opsh exec -- "grep 'a b' log"`).
fn command_line(words: &[String]) -> String {
    words.join(" ")
}

async fn run_async(target: Target, command: String, stream: bool) -> Result<i32, CommandError> {
    let session = connect(&target).await?;
    let outcome = if stream {
        session.run_streaming(&command, output::stream_chunk).await
    } else {
        session.run(&command).await
    };
    session.close().await;
    let result = outcome?;

    if !stream {
        std::io::stdout().write_all(result.stdout())?;
        std::io::stderr().write_all(result.stderr())?;
    }

    match result.exit_status() {
        Some(code) => Ok(code),
        None => Err(format!("Remote command ended with {}", describe_exit(&result)).into()),
    }
}
