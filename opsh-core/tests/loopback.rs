//! End-to-end tests against an in-process russh server that runs commands
//! with `sh -c`.
#![cfg(unix)]

use opsh_core::{
    ConnectFailure, Credential, Endpoint, ExecutionError, HostKeyPolicy, OutputStream,
    RemoteSession, Secret, SessionOptions, SessionState, TransferRequest,
};
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, ChannelMsg};
use std::collections::HashMap;
use std::path::Path;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

const PASSWORD: &str = "loopback-test-password";

#[derive(Clone)]
struct ShellServer {
    password: String,
}

impl russh::server::Server for ShellServer {
    type Handler = ShellHandler;

    fn new_client(&mut self, _: Option<std::net::SocketAddr>) -> ShellHandler {
        ShellHandler {
            password: self.password.clone(),
            channels: HashMap::new(),
        }
    }
}

struct ShellHandler {
    password: String,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl russh::server::Handler for ShellHandler {
    type Error = russh::Error;

    fn auth_password(
        &mut self,
        _user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let accepted = password == self.password;
        async move {
            if accepted {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::reject())
            }
        }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        self.channels.insert(channel.id(), channel);
        async { Ok(true) }
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let command = String::from_utf8_lossy(data).into_owned();
        let _ = session.channel_success(channel);
        if let Some(channel) = self.channels.remove(&channel) {
            tokio::spawn(run_shell(channel, command));
        }
        async { Ok(()) }
    }
}

async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> usize {
    match pipe {
        Some(pipe) => pipe.read(buf).await.unwrap_or(0),
        None => 0,
    }
}

/// Runs `command` with the channel wired to its stdin, stdout and stderr.
async fn run_shell(mut channel: Channel<Msg>, command: String) {
    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let Ok(mut child) = spawned else {
        let _ = channel.exit_status(127).await;
        let _ = channel.close().await;
        return;
    };

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; 4096];
    let mut err_buf = vec![0u8; 4096];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(pipe) = stdin.as_mut()
                        && pipe.write_all(&data).await.is_err()
                    {
                        stdin = None;
                    }
                }
                Some(ChannelMsg::Eof) => stdin = None,
                Some(_) => {}
                // Client went away; dropping the child kills it.
                None => return,
            },
            n = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                if n == 0 || channel.data(&out_buf[..n]).await.is_err() {
                    stdout = None;
                }
            }
            n = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                if n == 0 || channel.extended_data(1, &err_buf[..n]).await.is_err() {
                    stderr = None;
                }
            }
        }
    }
    drop(stdin);

    let code = child
        .wait()
        .await
        .ok()
        .and_then(|status| status.code())
        .unwrap_or(255);

    let _ = channel.exit_status(code as u32).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

struct Loopback {
    port: u16,
    task: JoinHandle<()>,
    known_hosts: TempDir,
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Loopback {
    fn endpoint(&self, password: &str) -> Endpoint {
        self.endpoint_on(self.port, password)
    }

    fn endpoint_on(&self, port: u16, password: &str) -> Endpoint {
        Endpoint::new(
            "127.0.0.1",
            port,
            "deploy",
            Credential::Password(Secret::new(password)),
        )
        .unwrap()
    }

    fn options(&self, policy: HostKeyPolicy) -> SessionOptions {
        SessionOptions::new(policy)
            .with_known_hosts(self.known_hosts.path().join("known_hosts"))
            .with_connect_timeout(Duration::from_secs(10))
    }

    async fn open(&self) -> RemoteSession {
        RemoteSession::open(self.endpoint(PASSWORD), self.options(HostKeyPolicy::AcceptNew))
            .await
            .expect("open session")
    }
}

async fn start_server() -> Option<Loopback> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.ok()?;
    let port = listener.local_addr().ok()?.port();

    let host_key = PrivateKey::random(&mut rand::rng(), Algorithm::Ed25519).ok()?;
    let config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_millis(0),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        inactivity_timeout: Some(Duration::from_secs(30)),
        keys: vec![host_key],
        ..Default::default()
    });

    let mut server = ShellServer {
        password: PASSWORD.to_string(),
    };
    let task = tokio::spawn(async move {
        let _ = server.run_on_socket(config, &listener).await;
    });

    Some(Loopback {
        port,
        task,
        known_hosts: TempDir::new().ok()?,
    })
}

#[tokio::test]
async fn runs_commands_and_reports_exit_status() {
    let Some(server) = start_server().await else {
        return;
    };
    let session = server.open().await;

    let result = session.run("true").await.unwrap();
    assert_eq!(result.exit_status(), Some(0));
    assert!(result.stderr().is_empty());

    let result = session.run("exit 7").await.unwrap();
    assert_eq!(result.exit_status(), Some(7));

    let result = session.run("echo out; echo err >&2").await.unwrap();
    assert_eq!(result.stdout_lossy(), "out\n");
    assert_eq!(result.stderr_lossy(), "err\n");

    // No state carries over between commands.
    session.run("cd /tmp && export OPSH_MARK=1").await.unwrap();
    let result = session.run("echo \"${OPSH_MARK:-unset}\"").await.unwrap();
    assert_eq!(result.stdout_lossy(), "unset\n");

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.run("true").await,
        Err(ExecutionError::NotConnected)
    ));
}

#[tokio::test]
async fn streams_chunks_before_the_command_returns() {
    let Some(server) = start_server().await else {
        return;
    };
    let session = server.open().await;

    let mut first_chunk_at = None;
    let mut streamed = Vec::new();
    let result = session
        .run_streaming(
            "printf 'one\\n'; sleep 0.3; printf 'two\\n'; sleep 0.3; printf 'three\\n'",
            |stream, data| {
                assert_eq!(stream, OutputStream::Stdout);
                first_chunk_at.get_or_insert_with(Instant::now);
                streamed.extend_from_slice(data);
            },
        )
        .await
        .unwrap();
    let returned_at = Instant::now();

    assert_eq!(streamed, result.stdout());
    assert_eq!(result.stdout_lossy(), "one\ntwo\nthree\n");
    let first = first_chunk_at.expect("at least one chunk");
    assert!(returned_at.duration_since(first) >= Duration::from_millis(300));

    session.close().await;
}

#[tokio::test]
async fn close_interrupts_a_running_command() {
    let Some(server) = start_server().await else {
        return;
    };
    let session = Arc::new(server.open().await);

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.run_streaming("sleep 5", |_, _| {}).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    session.close().await;

    let res = tokio::time::timeout(Duration::from_secs(3), running)
        .await
        .expect("command must end promptly after close")
        .unwrap();
    assert!(matches!(res, Err(ExecutionError::ConnectionLost(_))));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn wrong_password_is_auth_failed() {
    let Some(server) = start_server().await else {
        return;
    };

    let err = RemoteSession::open(
        server.endpoint("wrong"),
        server.options(HostKeyPolicy::AcceptAny),
    )
    .await
    .unwrap_err();
    assert_eq!(err.reason(), ConnectFailure::AuthFailed);
}

#[tokio::test]
async fn strict_policy_refuses_unknown_host() {
    let Some(server) = start_server().await else {
        return;
    };

    let err = RemoteSession::open(
        server.endpoint(PASSWORD),
        server.options(HostKeyPolicy::Strict),
    )
    .await
    .unwrap_err();
    assert_eq!(err.reason(), ConnectFailure::AuthFailed);

    // Learn the key once, then strict verification succeeds.
    server.open().await.close().await;
    let session = RemoteSession::open(
        server.endpoint(PASSWORD),
        server.options(HostKeyPolicy::Strict),
    )
    .await
    .unwrap();
    session.close().await;
}

/// Forwards one TCP connection to `target` until the returned task is aborted.
async fn start_proxy(target: u16) -> Option<(u16, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.ok()?;
    let port = listener.local_addr().ok()?.port();
    let task = tokio::spawn(async move {
        let Ok((mut inbound, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut outbound) = tokio::net::TcpStream::connect(("127.0.0.1", target)).await else {
            return;
        };
        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
    });
    Some((port, task))
}

#[tokio::test]
async fn dropped_connection_fails_the_running_command() {
    let Some(server) = start_server().await else {
        return;
    };
    let Some((proxy_port, proxy)) = start_proxy(server.port).await else {
        return;
    };

    let session = Arc::new(
        RemoteSession::open(
            server.endpoint_on(proxy_port, PASSWORD),
            server.options(HostKeyPolicy::AcceptNew),
        )
        .await
        .expect("open session through proxy"),
    );

    let running = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .run_streaming("echo started; sleep 5; echo finished", |_, _| {})
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    proxy.abort();

    let res = tokio::time::timeout(Duration::from_secs(4), running)
        .await
        .expect("command must end once the connection is cut")
        .unwrap();
    assert!(matches!(res, Err(ExecutionError::ConnectionLost(_))), "{res:?}");
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        session.run("true").await,
        Err(ExecutionError::NotConnected)
    ));
}

fn scp_available() -> bool {
    std::process::Command::new("sh")
        .args(["-c", "command -v scp"])
        .stdout(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn write(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn scp_round_trip_against_system_scp() {
    if !scp_available() {
        return;
    }
    let Some(server) = start_server().await else {
        return;
    };
    let session = server.open().await;

    let local = TempDir::new().unwrap();
    let root = local.path().join("site");
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("index.html", b"<html></html>\n".to_vec()),
        ("assets/app.js", b"console.log(1)\n".to_vec()),
        ("assets/empty.txt", Vec::new()),
        ("assets/img/logo.bin", (0..=255u8).cycle().take(200_000).collect()),
    ];
    for (rel, content) in &files {
        write(&root.join(rel), content);
    }

    // The "remote" side is this machine.
    let remote = TempDir::new().unwrap();
    let remote_dir = remote.path().to_str().unwrap().to_string();
    let summary = session
        .upload(&TransferRequest::new(&root, remote_dir.as_str(), true))
        .await
        .unwrap();
    assert_eq!(summary.files, files.len() as u64);
    assert_eq!(summary.directories, 3);
    for (rel, content) in &files {
        let uploaded = std::fs::read(remote.path().join("site").join(rel)).unwrap();
        assert_eq!(&uploaded, content, "upload mismatch for {rel}");
    }

    let back = TempDir::new().unwrap();
    let summary = session
        .download(&format!("{}/site", remote_dir), back.path(), true)
        .await
        .unwrap();
    assert_eq!(summary.files, files.len() as u64);
    for (rel, content) in &files {
        let downloaded = std::fs::read(back.path().join("site").join(rel)).unwrap();
        assert_eq!(&downloaded, content, "download mismatch for {rel}");
    }

    assert!(session.is_open());
    session.close().await;
}
