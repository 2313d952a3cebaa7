use std::sync::Arc;

use opsh_core::{ExecutionError, RemoteCommand, RemoteSession, SessionState};

use super::{CommandError, connect, describe_exit, setting, show};
use crate::config::Target;
use crate::output;

fn status_commands(app_dir: &str, tail: u32) -> Vec<(&'static str, RemoteCommand)> {
    vec![
        (
            "Compose status",
            RemoteCommand::new("docker-compose").arg("ps").in_dir(app_dir),
        ),
        (
            "Recent logs",
            RemoteCommand::new("docker-compose")
                .args(["logs", "--tail"])
                .arg(tail.to_string())
                .in_dir(app_dir),
        ),
    ]
}

fn rebuild_command(app_dir: &str) -> RemoteCommand {
    RemoteCommand::new("docker-compose")
        .arg("down")
        .and(RemoteCommand::new("docker-compose").args([
            "up",
            "-d",
            "--build",
            "--force-recreate",
        ]))
        .in_dir(app_dir)
}

pub fn run(target: Target, dir: Option<String>, tail: u32) -> Result<(), CommandError> {
    let app_dir = setting(dir.as_deref(), target.app_dir.as_deref(), "app_dir", &target)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = Arc::new(connect(&target).await?);

        // Ctrl+c closes the session, which ends the running command.
        let interrupt = {
            let session = session.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    output::warning("Interrupted, closing session");
                    session.close().await;
                }
            })
        };

        let outcome = rebuild(&session, &app_dir, tail).await;
        interrupt.abort();
        session.close().await;
        outcome?;

        output::success(&format!("Rebuilt {} in {}", target.name, app_dir));
        Ok::<(), CommandError>(())
    })
}

async fn rebuild(session: &RemoteSession, app_dir: &str, tail: u32) -> Result<(), CommandError> {
    for (title, command) in status_commands(app_dir, tail) {
        show(session, title, &command).await?;
    }

    output::section("Rebuild");
    let command = rebuild_command(app_dir);
    let result = match session.run_streaming(&command, output::stream_chunk).await {
        Ok(result) => result,
        Err(ExecutionError::ConnectionLost(_)) if session.state() == SessionState::Closed => {
            return Err("Rebuild interrupted; the remote command may still be running".into());
        }
        Err(e) => return Err(e.into()),
    };

    if !result.success() {
        return Err(format!("Rebuild exited with {}", describe_exit(&result)).into());
    }
    Ok(())
}
