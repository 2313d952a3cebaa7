//! Secure copy (SCP) over an exec channel
//!
//! Upload runs the remote side in sink mode (`scp -t`), download in source
//! mode (`scp -f`). Both directions exchange one control line per file or
//! directory and confirm every step with a single status byte: `0` for ok,
//! `1` (warning) or `2` (fatal) followed by a message line.

use crate::command::shell_quote;
use crate::error::{ChannelError, TransferError};
use crate::transport::{ChannelEvent, ExecChannel, Transport};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// A single file or directory copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub recursive: bool,
}

impl TransferRequest {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        recursive: bool,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            recursive,
        }
    }

    /// Check the local side before any bytes are sent.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.remote_path.trim().is_empty() {
            return Err(TransferError::InvalidRequest(
                "remote path must not be empty".to_string(),
            ));
        }

        let metadata = std::fs::metadata(&self.local_path)
            .map_err(|_| TransferError::LocalPathMissing(self.local_path.clone()))?;

        if metadata.is_dir() && !self.recursive {
            return Err(TransferError::InvalidRequest(format!(
                "{} is a directory; recursive transfer required",
                self.local_path.display()
            )));
        }
        if !metadata.is_dir() && !metadata.is_file() {
            return Err(TransferError::InvalidRequest(format!(
                "{} is not a regular file or directory",
                self.local_path.display()
            )));
        }
        Ok(())
    }
}

/// What a transfer moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum PlanItem {
    EnterDir { name: String, mode: u32 },
    File {
        path: PathBuf,
        name: String,
        size: u64,
        mode: u32,
    },
    ExitDir,
}

fn local_io(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::LocalIo {
        path: path.to_path_buf(),
        source,
    }
}

fn entry_name(path: &Path) -> Result<String, TransferError> {
    let name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => std::fs::canonicalize(path)
            .map_err(|e| local_io(path, e))?
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                TransferError::InvalidRequest(format!("{} has no file name", path.display()))
            })?,
    };

    let name = name.into_string().map_err(|_| {
        TransferError::InvalidRequest(format!("{} is not valid UTF-8", path.display()))
    })?;
    if name.contains('\n') {
        return Err(TransferError::InvalidRequest(format!(
            "{} contains a newline",
            path.display()
        )));
    }
    Ok(name)
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_metadata: &std::fs::Metadata, default: u32) -> u32 {
    default
}

/// Flatten the local tree into SCP control steps, directories sorted by name.
fn plan(local: &Path, recursive: bool) -> Result<Vec<PlanItem>, TransferError> {
    let metadata = std::fs::metadata(local)
        .map_err(|_| TransferError::LocalPathMissing(local.to_path_buf()))?;
    let mut items = Vec::new();
    push_entry(local, &metadata, recursive, &mut items)?;
    Ok(items)
}

fn push_entry(
    path: &Path,
    metadata: &std::fs::Metadata,
    recursive: bool,
    items: &mut Vec<PlanItem>,
) -> Result<(), TransferError> {
    let name = entry_name(path)?;

    if metadata.is_file() {
        items.push(PlanItem::File {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            mode: mode_of(metadata, DEFAULT_FILE_MODE),
        });
        return Ok(());
    }

    if !metadata.is_dir() || !recursive {
        tracing::debug!(path = %path.display(), "Skipping non-regular entry");
        return Ok(());
    }

    items.push(PlanItem::EnterDir {
        name,
        mode: mode_of(metadata, DEFAULT_DIR_MODE),
    });

    let mut children = std::fs::read_dir(path)
        .map_err(|e| local_io(path, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| local_io(path, e))?;
    children.sort();

    for child in children {
        let link_meta = std::fs::symlink_metadata(&child).map_err(|e| local_io(&child, e))?;
        if !link_meta.file_type().is_symlink() {
            push_entry(&child, &link_meta, recursive, items)?;
            continue;
        }

        // Linked files are copied by content; linked directories are not walked.
        match std::fs::metadata(&child) {
            Ok(target) if target.is_file() => push_entry(&child, &target, recursive, items)?,
            Ok(_) => tracing::debug!(path = %child.display(), "Skipping symlinked directory"),
            Err(e) => {
                tracing::debug!(path = %child.display(), error = %e, "Skipping dangling symlink")
            }
        }
    }

    items.push(PlanItem::ExitDir);
    Ok(())
}

fn remote_arg(path: &str) -> String {
    if path.starts_with('-') {
        shell_quote(&format!("./{}", path))
    } else {
        shell_quote(path)
    }
}

fn sink_command(remote_path: &str, recursive: bool) -> String {
    let flags = if recursive { "-r -t" } else { "-t" };
    format!("scp {} {}", flags, remote_arg(remote_path))
}

fn source_command(remote_path: &str, recursive: bool) -> String {
    let flags = if recursive { "-r -f" } else { "-f" };
    format!("scp {} {}", flags, remote_arg(remote_path))
}

/// Parsed `C`/`D` control line (without the leading letter).
#[derive(Debug, PartialEq, Eq)]
struct Header {
    mode: u32,
    size: u64,
    name: String,
}

fn parse_header(rest: &[u8]) -> Result<Header, TransferError> {
    let text = std::str::from_utf8(rest)
        .map_err(|_| TransferError::Protocol("control line is not valid UTF-8".to_string()))?;
    let mut parts = text.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TransferError::Protocol(format!(
            "malformed control line '{}'",
            text
        )));
    };

    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| TransferError::Protocol(format!("invalid mode '{}'", mode)))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| TransferError::Protocol(format!("invalid size '{}'", size)))?;

    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(TransferError::Protocol(format!(
            "refusing unsafe remote file name '{}'",
            name
        )));
    }

    Ok(Header {
        mode,
        size,
        name: name.to_string(),
    })
}

/// Buffered reader/writer over one SCP exec channel.
struct ScpStream<'a> {
    channel: Box<dyn ExecChannel>,
    transport: &'a dyn Transport,
    shutdown: &'a CancellationToken,
    buf: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    finished: bool,
}

fn session_closed() -> TransferError {
    TransferError::ConnectionLost("session closed during transfer".to_string())
}

impl<'a> ScpStream<'a> {
    async fn open(
        transport: &'a dyn Transport,
        shutdown: &'a CancellationToken,
        command: &str,
    ) -> Result<Self, TransferError> {
        tracing::debug!(command = %command, "Starting remote scp");

        let opened = tokio::select! {
            res = transport.exec(command) => res,
            _ = shutdown.cancelled() => return Err(session_closed()),
        };

        let channel = opened.map_err(|e| match e {
            ChannelError::Rejected(reason) => {
                TransferError::Protocol(format!("server refused to start scp: {}", reason))
            }
            other if transport.is_closed() => TransferError::ConnectionLost(other.to_string()),
            other => TransferError::Protocol(other.to_string()),
        })?;

        Ok(Self {
            channel,
            transport,
            shutdown,
            buf: Vec::new(),
            stderr: Vec::new(),
            exit_status: None,
            finished: false,
        })
    }

    /// Pull one event. Returns `false` once the channel is closed.
    async fn fill(&mut self) -> Result<bool, TransferError> {
        if self.finished {
            return Ok(false);
        }

        let event = tokio::select! {
            event = self.channel.recv() => event,
            _ = self.shutdown.cancelled() => return Err(session_closed()),
        };

        match event {
            Some(ChannelEvent::Stdout(data)) => self.buf.extend_from_slice(&data),
            Some(ChannelEvent::Stderr(data)) => self.stderr.extend_from_slice(&data),
            Some(ChannelEvent::ExitStatus(code)) => self.exit_status = Some(code),
            Some(ChannelEvent::ExitSignal(_)) | Some(ChannelEvent::Eof) => {}
            None => self.finished = true,
        }
        Ok(!self.finished)
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn unexpected_end(&self) -> TransferError {
        if self.transport.is_closed() {
            return TransferError::ConnectionLost(
                "connection dropped during transfer".to_string(),
            );
        }
        let stderr = self.stderr_text();
        if stderr.is_empty() {
            TransferError::Protocol("remote scp exited unexpectedly".to_string())
        } else {
            TransferError::Protocol(format!("remote scp exited unexpectedly: {}", stderr))
        }
    }

    async fn read_byte(&mut self) -> Result<Option<u8>, TransferError> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buf.remove(0)))
    }

    /// Next `\n`-terminated line without the terminator; `None` at a clean end.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(self.unexpected_end());
            }
        }
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, TransferError> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Err(self.unexpected_end());
            }
        }
        let n = max.min(self.buf.len());
        Ok(self.buf.drain(..n).collect())
    }

    async fn read_ack(
        &mut self,
        on_error: fn(String) -> TransferError,
    ) -> Result<(), TransferError> {
        match self.read_byte().await? {
            Some(0) => Ok(()),
            Some(1) | Some(2) => {
                let message = self.read_line().await?.unwrap_or_default();
                let message = String::from_utf8_lossy(&message).trim().to_string();
                Err(on_error(message))
            }
            Some(other) => Err(TransferError::Protocol(format!(
                "unexpected response byte {:#04x}",
                other
            ))),
            None => Err(self.unexpected_end()),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let sent = tokio::select! {
            res = self.channel.send(data) => res,
            _ = self.shutdown.cancelled() => return Err(session_closed()),
        };
        sent.map_err(|e| {
            if self.transport.is_closed() {
                TransferError::ConnectionLost(e.to_string())
            } else {
                TransferError::Protocol(e.to_string())
            }
        })
    }

    /// Close stdin and wait for the remote scp to exit.
    async fn finish(mut self) -> Result<(Option<u32>, String), TransferError> {
        if !self.finished {
            let _ = self.channel.send_eof().await;
        }
        while self.fill().await? {}

        if self.exit_status.is_none() && self.transport.is_closed() {
            return Err(TransferError::ConnectionLost(
                "connection dropped before remote scp exited".to_string(),
            ));
        }
        let stderr = self.stderr_text();
        Ok((self.exit_status, stderr))
    }
}

fn exit_failure(status: Option<u32>, stderr: String) -> String {
    match (status, stderr.is_empty()) {
        (_, false) => stderr,
        (Some(code), true) => format!("remote scp exited with status {}", code),
        (None, true) => "remote scp was terminated".to_string(),
    }
}

/// Copy a local file or tree to the remote host.
pub(crate) async fn upload<P>(
    transport: &dyn Transport,
    shutdown: &CancellationToken,
    request: &TransferRequest,
    mut progress: P,
) -> Result<TransferSummary, TransferError>
where
    P: FnMut(u64, u64) + Send,
{
    request.validate()?;
    let items = plan(&request.local_path, request.recursive)?;
    let total: u64 = items
        .iter()
        .map(|item| match item {
            PlanItem::File { size, .. } => *size,
            _ => 0,
        })
        .sum();

    let mut stream = ScpStream::open(
        transport,
        shutdown,
        &sink_command(&request.remote_path, request.recursive),
    )
    .await?;
    stream.read_ack(TransferError::RemoteWriteDenied).await?;

    let mut summary = TransferSummary::default();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    for item in &items {
        match item {
            PlanItem::EnterDir { name, mode } => {
                stream
                    .send(format!("D{:04o} 0 {}\n", mode, name).as_bytes())
                    .await?;
                stream.read_ack(TransferError::RemoteWriteDenied).await?;
                summary.directories += 1;
            }
            PlanItem::ExitDir => {
                stream.send(b"E\n").await?;
                stream.read_ack(TransferError::RemoteWriteDenied).await?;
            }
            PlanItem::File {
                path,
                name,
                size,
                mode,
            } => {
                let mut file = File::open(path).await.map_err(|e| local_io(path, e))?;

                stream
                    .send(format!("C{:04o} {} {}\n", mode, size, name).as_bytes())
                    .await?;
                stream.read_ack(TransferError::RemoteWriteDenied).await?;

                let mut remaining = *size;
                while remaining > 0 {
                    let want = remaining.min(CHUNK_SIZE as u64) as usize;
                    let n = file
                        .read(&mut buffer[..want])
                        .await
                        .map_err(|e| local_io(path, e))?;
                    if n == 0 {
                        return Err(local_io(
                            path,
                            std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "file shrank during transfer",
                            ),
                        ));
                    }
                    stream.send(&buffer[..n]).await?;
                    remaining -= n as u64;
                    summary.bytes += n as u64;
                    progress(summary.bytes, total);
                }

                stream.send(&[0]).await?;
                stream.read_ack(TransferError::RemoteWriteDenied).await?;
                summary.files += 1;

                tracing::debug!(
                    local = %path.display(),
                    remote = %request.remote_path,
                    size = *size,
                    "File uploaded"
                );
            }
        }
    }

    match stream.finish().await? {
        (Some(0), _) => Ok(summary),
        (status, stderr) => Err(TransferError::RemoteWriteDenied(exit_failure(status, stderr))),
    }
}

async fn destination(local_root: &Path, dirs: &[PathBuf], name: &str) -> PathBuf {
    if let Some(parent) = dirs.last() {
        return parent.join(name);
    }
    match tokio::fs::metadata(local_root).await {
        Ok(meta) if meta.is_dir() => local_root.join(name),
        _ => local_root.to_path_buf(),
    }
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) -> Result<(), TransferError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
        .await
        .map_err(|e| local_io(path, e))
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) -> Result<(), TransferError> {
    Ok(())
}

/// Copy a remote file or tree to the local machine.
pub(crate) async fn download(
    transport: &dyn Transport,
    shutdown: &CancellationToken,
    remote_path: &str,
    local_path: &Path,
    recursive: bool,
) -> Result<TransferSummary, TransferError> {
    if remote_path.trim().is_empty() {
        return Err(TransferError::InvalidRequest(
            "remote path must not be empty".to_string(),
        ));
    }

    let mut stream =
        ScpStream::open(transport, shutdown, &source_command(remote_path, recursive)).await?;
    stream.send(&[0]).await?;

    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut summary = TransferSummary::default();

    while let Some(line) = stream.read_line().await? {
        let Some((&kind, rest)) = line.split_first() else {
            return Err(TransferError::Protocol("empty control line".to_string()));
        };

        match kind {
            1 | 2 => {
                return Err(TransferError::RemoteReadFailed(
                    String::from_utf8_lossy(rest).trim().to_string(),
                ));
            }
            b'T' => stream.send(&[0]).await?,
            b'C' => {
                let header = parse_header(rest)?;
                let dest = destination(local_path, &dirs, &header.name).await;
                let mut file = File::create(&dest).await.map_err(|e| local_io(&dest, e))?;
                stream.send(&[0]).await?;

                let mut remaining = header.size;
                while remaining > 0 {
                    let want = remaining.min(CHUNK_SIZE as u64) as usize;
                    let chunk = stream.read_chunk(want).await?;
                    file.write_all(&chunk).await.map_err(|e| local_io(&dest, e))?;
                    remaining -= chunk.len() as u64;
                }
                file.flush().await.map_err(|e| local_io(&dest, e))?;
                drop(file);

                stream.read_ack(TransferError::RemoteReadFailed).await?;
                apply_mode(&dest, header.mode).await?;
                stream.send(&[0]).await?;

                summary.files += 1;
                summary.bytes += header.size;
                tracing::debug!(
                    remote = %remote_path,
                    local = %dest.display(),
                    size = header.size,
                    "File downloaded"
                );
            }
            b'D' => {
                if !recursive {
                    return Err(TransferError::Protocol(
                        "remote sent a directory for a non-recursive transfer".to_string(),
                    ));
                }
                let header = parse_header(rest)?;
                let dest = destination(local_path, &dirs, &header.name).await;
                tokio::fs::create_dir_all(&dest)
                    .await
                    .map_err(|e| local_io(&dest, e))?;
                dirs.push(dest);
                summary.directories += 1;
                stream.send(&[0]).await?;
            }
            b'E' => {
                if dirs.pop().is_none() {
                    return Err(TransferError::Protocol(
                        "unbalanced end-of-directory marker".to_string(),
                    ));
                }
                stream.send(&[0]).await?;
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected control byte {:#04x}",
                    other
                )));
            }
        }
    }

    if !dirs.is_empty() {
        return Err(stream.unexpected_end());
    }

    match stream.finish().await? {
        (Some(0), _) => Ok(summary),
        (status, stderr) => Err(TransferError::RemoteReadFailed(exit_failure(status, stderr))),
    }
}
