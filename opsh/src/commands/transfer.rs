use std::path::{Path, PathBuf};

use opsh_core::{RemoteSession, TransferRequest, TransferSummary};

use super::{CommandError, connect};
use crate::config::Target;
use crate::output;

pub fn upload(
    target: Target,
    local: PathBuf,
    remote: String,
    recursive: bool,
) -> Result<(), CommandError> {
    let request = TransferRequest::new(local, remote, recursive);
    // Fail on a bad local path before opening a connection.
    request.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = connect(&target).await?;
        let outcome = upload_with_progress(&session, &request).await;
        session.close().await;
        let summary = outcome?;

        output::success(&format!(
            "Uploaded {} to {}:{}",
            describe(&summary),
            target.name,
            request.remote_path
        ));
        Ok::<(), CommandError>(())
    })
}

/// Upload with a progress bar on interactive terminals.
pub(crate) async fn upload_with_progress(
    session: &RemoteSession,
    request: &TransferRequest,
) -> Result<TransferSummary, CommandError> {
    let label = request
        .local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.local_path.display().to_string());
    let pb = output::transfer_progress(&label);

    let outcome = session
        .upload_with_progress(request, |done, total| {
            pb.set_length(total);
            pb.set_position(done);
        })
        .await;

    pb.finish_and_clear();
    Ok(outcome?)
}

pub fn download(
    target: Target,
    remote: String,
    local: PathBuf,
    recursive: bool,
) -> Result<(), CommandError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = connect(&target).await?;
        let outcome = session.download(&remote, &local, recursive).await;
        session.close().await;
        let summary = outcome?;

        output::success(&format!(
            "Downloaded {} from {}:{} to {}",
            describe(&summary),
            target.name,
            remote,
            display_local(&local)
        ));
        Ok::<(), CommandError>(())
    })
}

fn display_local(path: &Path) -> String {
    output::emphasized(&path.display().to_string())
}

pub(crate) fn describe(summary: &TransferSummary) -> String {
    let files = if summary.files == 1 { "file" } else { "files" };
    if summary.directories > 0 {
        format!(
            "{} {} in {} directories ({})",
            summary.files,
            files,
            summary.directories,
            output::human_bytes(summary.bytes)
        )
    } else {
        format!(
            "{} {} ({})",
            summary.files,
            files,
            output::human_bytes(summary.bytes)
        )
    }
}
