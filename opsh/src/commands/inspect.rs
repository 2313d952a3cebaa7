use opsh_core::{RemoteCommand, RemoteSession};

use super::{CommandError, connect, setting, show};
use crate::config::Target;
use crate::output;

/// Inputs for the diagnostic report.
struct Inspection {
    app_dir: String,
    service: String,
    container: Option<String>,
    html_dir: String,
    tail: u32,
}

impl Inspection {
    fn commands(&self) -> Vec<(&'static str, RemoteCommand)> {
        let mut commands = vec![(
            "Container status",
            RemoteCommand::new("docker")
                .args(["ps", "-a"])
                .pipe(RemoteCommand::new("grep").arg(&self.service)),
        )];

        if let Some(container) = &self.container {
            commands.push((
                "Served files",
                RemoteCommand::new("docker")
                    .arg("exec")
                    .arg(container)
                    .args(["ls", "-la", self.html_dir.as_str()]),
            ));
        }

        commands.push((
            "Recent logs",
            RemoteCommand::new("docker-compose")
                .args(["logs", "--tail"])
                .arg(self.tail.to_string())
                .arg(&self.service)
                .in_dir(&self.app_dir),
        ));
        commands.push((
            "Errors in logs",
            RemoteCommand::new("docker-compose")
                .arg("logs")
                .arg(&self.service)
                .redirect_stderr_to_stdout()
                .pipe(RemoteCommand::new("grep").args(["-i", "error"]))
                .pipe(RemoteCommand::new("tail").arg("-20"))
                .in_dir(&self.app_dir),
        ));
        commands
    }
}

pub fn run(
    target: Target,
    dir: Option<String>,
    service: Option<String>,
    container: Option<String>,
    html_dir: String,
    tail: u32,
) -> Result<(), CommandError> {
    let inspection = Inspection {
        app_dir: setting(dir.as_deref(), target.app_dir.as_deref(), "app_dir", &target)?,
        service: setting(service.as_deref(), target.service.as_deref(), "service", &target)?,
        container: container.or_else(|| target.container.clone()),
        html_dir,
        tail,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = connect(&target).await?;
        let outcome = inspect(&session, &inspection).await;
        session.close().await;
        outcome
    })
}

async fn inspect(session: &RemoteSession, inspection: &Inspection) -> Result<(), CommandError> {
    if inspection.container.is_none() {
        output::warning("No container configured; skipping served files listing");
    }
    for (title, command) in inspection.commands() {
        let result = show(session, title, &command).await?;
        // grep exits 1 when nothing matched
        if result.exit_status() == Some(1) && result.stdout().is_empty() {
            output::muted("(no matches)");
        }
    }
    Ok(())
}
