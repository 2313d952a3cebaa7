use opsh_core::{CommandResult, RemoteCommand};

use super::{CommandError, describe_exit, setting};
use crate::config::Target;
use crate::output;

type TaskError = Box<dyn std::error::Error + Send + Sync>;

struct Report {
    steps: Vec<(&'static str, CommandResult)>,
}

/// Container health checks, in the order they are run.
fn check_commands(container: &str, html_dir: &str) -> Vec<(&'static str, RemoteCommand)> {
    vec![
        ("Running containers", RemoteCommand::new("docker").arg("ps")),
        (
            "Served files",
            RemoteCommand::new("docker")
                .arg("exec")
                .arg(container)
                .args(["ls", "-R", html_dir]),
        ),
        (
            "Container logs",
            RemoteCommand::new("docker")
                .arg("logs")
                .arg(container)
                .redirect_stderr_to_stdout(),
        ),
    ]
}

pub fn run(
    targets: Vec<Target>,
    container: Option<String>,
    html_dir: String,
) -> Result<(), CommandError> {
    let mut jobs = Vec::with_capacity(targets.len());
    for target in targets {
        let container = setting(
            container.as_deref(),
            target.container.as_deref(),
            "container",
            &target,
        )?;
        jobs.push((target, container));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(jobs, html_dir))
}

async fn run_async(jobs: Vec<(Target, String)>, html_dir: String) -> Result<(), CommandError> {
    let total = jobs.len();
    output::step(&format!("Checking {} host(s)", total));

    // Hosts are checked in parallel; reports print in the order given.
    let mut tasks = Vec::with_capacity(total);
    for (target, container) in jobs {
        let name = target.name.clone();
        let html_dir = html_dir.clone();
        let task = tokio::spawn(async move { check_host(target, container, html_dir).await });
        tasks.push((name, task));
    }

    let mut failed = 0;
    for (name, task) in tasks {
        output::section(&format!("Host {}", name));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(report) => print_report(&report),
            Err(e) => {
                failed += 1;
                output::error(&e.to_string());
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} hosts failed", failed, total).into());
    }
    output::success("All hosts checked");
    Ok(())
}

async fn check_host(
    target: Target,
    container: String,
    html_dir: String,
) -> Result<Report, TaskError> {
    let session = target.connect().await?;

    let mut steps = Vec::new();
    let mut failure = None;
    for (title, command) in check_commands(&container, &html_dir) {
        match session.run(&command).await {
            Ok(result) => steps.push((title, result)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    session.close().await;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(Report { steps }),
    }
}

fn print_report(report: &Report) {
    for (title, result) in &report.steps {
        output::step(title);
        output::command_output(result);
        if !result.success() {
            output::warning(&format!("Exited with {}", describe_exit(result)));
        }
    }
}
