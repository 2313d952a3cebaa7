use std::path::PathBuf;

use opsh_core::{RemoteCommand, RemoteSession, TransferRequest};

use super::{CommandError, connect, describe_exit, run_checked, setting};
use crate::commands::transfer::{describe, upload_with_progress};
use crate::config::Target;
use crate::output;

/// Project files copied when no items are given.
pub const DEFAULT_ITEMS: &[&str] = &[
    "package.json",
    "pnpm-lock.yaml",
    "pnpm-workspace.yaml",
    "docker-compose.yml",
    "apps",
    "packages",
];

pub fn run(target: Target, dir: Option<String>, items: Vec<PathBuf>) -> Result<(), CommandError> {
    let app_dir = setting(dir.as_deref(), target.app_dir.as_deref(), "app_dir", &target)?;
    let items = if items.is_empty() {
        DEFAULT_ITEMS.iter().map(PathBuf::from).collect()
    } else {
        items
    };

    let (present, missing) = split_existing(items);
    if present.is_empty() {
        return Err("Nothing to deploy: none of the listed files exist".into());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = connect(&target).await?;
        let outcome = deploy(&session, &app_dir, &present, &missing).await;
        session.close().await;
        outcome?;

        output::success(&format!(
            "Deployed to {} in {}",
            output::emphasized(&target.name),
            app_dir
        ));
        Ok::<(), CommandError>(())
    })
}

fn split_existing(items: Vec<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
    items.into_iter().partition(|item| item.exists())
}

async fn deploy(
    session: &RemoteSession,
    app_dir: &str,
    present: &[PathBuf],
    missing: &[PathBuf],
) -> Result<(), CommandError> {
    output::section("Upload");
    run_checked(session, RemoteCommand::new("mkdir").arg("-p").arg(app_dir)).await?;

    for item in missing {
        output::warning(&format!("Skipping {} (not found)", item.display()));
    }

    for item in present {
        let request = TransferRequest::new(item, app_dir, item.is_dir());
        let summary = upload_with_progress(session, &request).await?;
        output::step(&format!("{}: {}", item.display(), describe(&summary)));
    }

    output::section("Build");
    let build = RemoteCommand::new("docker-compose")
        .args(["up", "-d", "--build"])
        .in_dir(app_dir);
    let result = session.run_streaming(&build, output::stream_chunk).await?;
    if !result.success() {
        return Err(format!("docker-compose up exited with {}", describe_exit(&result)).into());
    }
    Ok(())
}
