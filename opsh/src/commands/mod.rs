pub mod check;
pub mod deploy;
pub mod exec;
pub mod firewall;
pub mod inspect;
pub mod rebuild;
pub mod transfer;

use opsh_core::{CommandResult, RemoteSession};

use crate::config::Target;
use crate::output;

pub(crate) type CommandError = Box<dyn std::error::Error>;

/// Exactly one target; commands other than `check` work on a single host.
pub(crate) fn single(targets: Vec<Target>) -> Result<Target, CommandError> {
    let count = targets.len();
    let mut iter = targets.into_iter();
    match (iter.next(), count) {
        (Some(target), 1) => Ok(target),
        _ => Err(format!("This command targets exactly one host, got {}", count).into()),
    }
}

pub(crate) async fn connect(target: &Target) -> Result<RemoteSession, CommandError> {
    output::step(&format!(
        "Connecting to {} ({})",
        output::emphasized(&target.name),
        target.endpoint
    ));
    let session = target.connect().await?;
    output::success("Connected");
    Ok(session)
}

/// Value from a flag, falling back to the host entry.
pub(crate) fn setting(
    flag: Option<&str>,
    configured: Option<&str>,
    key: &str,
    target: &Target,
) -> Result<String, CommandError> {
    flag.or(configured)
        .map(str::to_string)
        .ok_or_else(|| {
            format!(
                "No {} for host '{}'. Pass --{} or set {} in config",
                key.replace('_', " "),
                target.name,
                key.replace('_', "-"),
                key
            )
            .into()
        })
}

/// Run a command and print its output under a heading.
pub(crate) async fn show(
    session: &RemoteSession,
    title: &str,
    command: impl AsRef<str>,
) -> Result<CommandResult, CommandError> {
    let command = command.as_ref();
    output::section(title);
    if output::is_verbose() {
        output::muted(&format!("$ {}", command));
    }
    let result = session.run(command).await?;
    output::command_output(&result);
    if !result.success() {
        output::warning(&format!("Exited with {}", describe_exit(&result)));
    }
    Ok(result)
}

/// Run a command that must succeed.
pub(crate) async fn run_checked(
    session: &RemoteSession,
    command: impl AsRef<str>,
) -> Result<CommandResult, CommandError> {
    let command = command.as_ref();
    let result = session.run(command).await?;
    if result.success() {
        return Ok(result);
    }
    Err(failure_message(command, &result).into())
}

fn failure_message(command: &str, result: &CommandResult) -> String {
    let output = result.combined();
    let output = output.trim();
    if output.is_empty() {
        format!("'{}' failed with {}", command, describe_exit(result))
    } else {
        format!("'{}' failed with {}: {}", command, describe_exit(result), output)
    }
}

pub(crate) fn describe_exit(result: &CommandResult) -> String {
    match (result.exit_status(), result.exit_signal()) {
        (Some(code), _) => format!("status {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "no exit status".to_string(),
    }
}
