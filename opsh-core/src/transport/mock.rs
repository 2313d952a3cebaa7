//! In-memory transport for tests
//!
//! Built-in commands:
//! - `true`, `exit N`, `echo ...`
//! - `sleep ...` never finishes
//! - `drop` emits a little output and then loses the connection
//! - `reject` is refused by the "server"
//! - `scp -t` / `scp -f` speak SCP against an in-memory filesystem
//! - anything else exits 127 with "not found" on stderr
//!
//! Exact command lines can be scripted with [`MockRemote::script`].

use super::{ChannelEvent, Connector, ExecChannel, Transport};
use crate::endpoint::{Endpoint, SessionOptions};
use crate::error::{ChannelError, ConnectFailure, ConnectionError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Shared state of the fake remote host.
#[derive(Default)]
pub(crate) struct MockRemote {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    closed: AtomicBool,
    commands: Mutex<Vec<String>>,
    fs: Mutex<BTreeMap<String, Node>>,
    denied: Mutex<BTreeSet<String>>,
    scripts: Mutex<HashMap<String, Vec<ChannelEvent>>>,
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

impl MockRemote {
    pub(crate) fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.lock_fs().insert("/".to_string(), Node::Dir);
        Arc::new(remote)
    }

    fn lock_fs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.fs.lock().unwrap()
    }

    pub(crate) fn mkdir(&self, path: &str) {
        let mut fs = self.lock_fs();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(if current.is_empty() { "/" } else { &current }, part);
            fs.insert(current.clone(), Node::Dir);
        }
    }

    pub(crate) fn write_file(&self, path: &str, content: &[u8]) {
        self.lock_fs()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock_fs().get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock_fs().get(path), Some(Node::Dir))
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.lock_fs()
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && parent_of(path) == dir)
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect()
    }

    /// Writes into `dir` fail with "Permission denied".
    pub(crate) fn deny_writes(&self, dir: &str) {
        self.denied.lock().unwrap().insert(dir.to_string());
    }

    fn writable(&self, path: &str) -> bool {
        let parent = parent_of(path);
        self.is_dir(&parent) && !self.denied.lock().unwrap().contains(&parent)
    }

    pub(crate) fn script(&self, command: &str, events: Vec<ChannelEvent>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), events);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub(crate) struct MockConnector {
    remote: Arc<MockRemote>,
    failure: Option<ConnectFailure>,
    delay: Option<Duration>,
}

impl MockConnector {
    pub(crate) fn new(remote: Arc<MockRemote>) -> Self {
        Self {
            remote,
            failure: None,
            delay: None,
        }
    }

    pub(crate) fn failing(remote: Arc<MockRemote>, failure: ConnectFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(remote)
        }
    }

    pub(crate) fn slow(remote: Arc<MockRemote>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(remote)
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _options: &SessionOptions,
    ) -> Result<MockTransport, ConnectionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.failure {
            Some(ConnectFailure::AuthFailed) => Err(ConnectionError::AuthFailed(format!(
                "server rejected credentials for user '{}'",
                endpoint.username()
            ))),
            Some(ConnectFailure::Unreachable) => Err(ConnectionError::Unreachable(
                "Connection refused (os error 111)".to_string(),
            )),
            Some(ConnectFailure::Timeout) => {
                Err(ConnectionError::Timeout(Duration::from_secs(30)))
            }
            None => {
                self.remote.connects.fetch_add(1, Ordering::SeqCst);
                self.remote.closed.store(false, Ordering::SeqCst);
                Ok(MockTransport::new(self.remote.clone()))
            }
        }
    }
}

pub(crate) struct MockTransport {
    remote: Arc<MockRemote>,
}

impl MockTransport {
    pub(crate) fn new(remote: Arc<MockRemote>) -> Self {
        Self { remote }
    }
}

fn canned(events: Vec<ChannelEvent>) -> Box<dyn ExecChannel> {
    let (tx, rx) = unbounded_channel();
    for event in events {
        let _ = tx.send(event);
    }
    Box::new(MockChannel {
        rx,
        peer: Peer::None,
    })
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if command == "reject" {
            return Err(ChannelError::Rejected(
                "administratively prohibited".to_string(),
            ));
        }
        self.remote.commands.lock().unwrap().push(command.to_string());

        if let Some(events) = self.remote.scripts.lock().unwrap().get(command) {
            return Ok(canned(events.clone()));
        }

        if command == "true" {
            return Ok(canned(vec![ChannelEvent::ExitStatus(0), ChannelEvent::Eof]));
        }
        if let Some(code) = command.strip_prefix("exit ") {
            let code = code.trim().parse().unwrap_or(2);
            return Ok(canned(vec![ChannelEvent::ExitStatus(code), ChannelEvent::Eof]));
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Ok(canned(vec![
                ChannelEvent::Stdout(format!("{}\n", text).into_bytes()),
                ChannelEvent::ExitStatus(0),
                ChannelEvent::Eof,
            ]));
        }
        if command.starts_with("sleep ") {
            let (tx, rx) = unbounded_channel();
            return Ok(Box::new(MockChannel {
                rx,
                peer: Peer::Hang(tx),
            }));
        }
        if command == "drop" {
            self.remote.closed.store(true, Ordering::SeqCst);
            return Ok(canned(vec![ChannelEvent::Stdout(b"partial".to_vec())]));
        }
        if let Some(args) = command.strip_prefix("scp ") {
            let (flags, target) = parse_scp_args(args);
            let recursive = flags.contains(&'r');
            let (tx, rx) = unbounded_channel();
            let peer = if flags.contains(&'t') {
                Peer::Sink(ScpSink::new(self.remote.clone(), tx, target, recursive))
            } else {
                Peer::Source(ScpSource::new(&self.remote, tx, &target, recursive))
            };
            return Ok(Box::new(MockChannel { rx, peer }));
        }

        let program = command.split_whitespace().next().unwrap_or_default();
        Ok(canned(vec![
            ChannelEvent::Stderr(format!("sh: 1: {}: not found\n", program).into_bytes()),
            ChannelEvent::ExitStatus(127),
            ChannelEvent::Eof,
        ]))
    }

    fn is_closed(&self) -> bool {
        self.remote.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.remote.disconnects.fetch_add(1, Ordering::SeqCst);
        self.remote.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Splits `-r -t 'path'` into flag letters and the unquoted target.
fn parse_scp_args(args: &str) -> (Vec<char>, String) {
    let mut flags = Vec::new();
    let mut rest = args.trim();
    while let Some(stripped) = rest.strip_prefix('-') {
        let (flag, tail) = stripped.split_once(' ').unwrap_or((stripped, ""));
        flags.extend(flag.chars());
        rest = tail.trim_start();
    }
    (flags, unquote(rest))
}

fn unquote(word: &str) -> String {
    let mut out = String::new();
    let mut in_quotes = false;
    let mut chars = word.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '\\' if !in_quotes => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

enum Peer {
    None,
    /// Keeps the sender alive so `recv` never completes.
    Hang(#[allow(dead_code)] UnboundedSender<ChannelEvent>),
    Sink(ScpSink),
    Source(ScpSource),
}

struct MockChannel {
    rx: UnboundedReceiver<ChannelEvent>,
    peer: Peer,
}

#[async_trait]
impl ExecChannel for MockChannel {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        match &mut self.peer {
            Peer::Sink(sink) => sink.feed(data),
            Peer::Source(source) => source.feed(data),
            Peer::None | Peer::Hang(_) => {}
        }
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), ChannelError> {
        if let Peer::Sink(sink) = &mut self.peer {
            sink.finish();
        }
        Ok(())
    }
}

/// Remote `scp -t`: receives files into the in-memory filesystem.
struct ScpSink {
    remote: Arc<MockRemote>,
    tx: Option<UnboundedSender<ChannelEvent>>,
    target: String,
    recursive: bool,
    buf: Vec<u8>,
    stack: Vec<String>,
    pending: Option<(String, u64, Vec<u8>)>,
    failed: bool,
}

impl ScpSink {
    fn new(
        remote: Arc<MockRemote>,
        tx: UnboundedSender<ChannelEvent>,
        target: String,
        recursive: bool,
    ) -> Self {
        let _ = tx.send(ChannelEvent::Stdout(vec![0]));
        Self {
            remote,
            tx: Some(tx),
            target,
            recursive,
            buf: Vec::new(),
            stack: Vec::new(),
            pending: None,
            failed: false,
        }
    }

    fn reply(&self, data: Vec<u8>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ChannelEvent::Stdout(data));
        }
    }

    fn fail(&mut self, message: String) {
        self.failed = true;
        self.reply(format!("\x01scp: {}\n", message).into_bytes());
    }

    fn dest(&self, name: &str) -> String {
        match self.stack.last() {
            Some(dir) => join(dir, name),
            None if self.remote.is_dir(&self.target) => join(&self.target, name),
            None => self.target.clone(),
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        loop {
            if let Some((path, remaining, mut content)) = self.pending.take() {
                if remaining > 0 {
                    let n = (remaining as usize).min(self.buf.len());
                    content.extend(self.buf.drain(..n));
                    self.pending = Some((path, remaining - n as u64, content));
                    if n == 0 {
                        return;
                    }
                    continue;
                }
                if self.buf.is_empty() {
                    self.pending = Some((path, 0, content));
                    return;
                }
                self.buf.remove(0);
                self.remote.write_file(&path, &content);
                self.reply(vec![0]);
                continue;
            }

            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        let (kind, rest) = line.split_at(1);
        let mut parts = rest.splitn(3, ' ');
        let _mode = parts.next();
        let size: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let name = parts.next().unwrap_or_default();

        match kind {
            "C" => {
                let dest = self.dest(name);
                if !self.remote.writable(&dest) {
                    self.fail(format!("{}: Permission denied", dest));
                    return;
                }
                self.pending = Some((dest, size, Vec::new()));
                self.reply(vec![0]);
            }
            "D" => {
                if !self.recursive {
                    self.fail("received directory without -r".to_string());
                    return;
                }
                let dest = self.dest(name);
                if !self.remote.writable(&dest) {
                    self.fail(format!("{}: Permission denied", dest));
                    return;
                }
                self.remote.mkdir(&dest);
                self.stack.push(dest);
                self.reply(vec![0]);
            }
            "E" => {
                self.stack.pop();
                self.reply(vec![0]);
            }
            _ => self.reply(vec![0]),
        }
    }

    fn finish(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ChannelEvent::ExitStatus(u32::from(self.failed)));
            let _ = tx.send(ChannelEvent::Eof);
        }
    }
}

/// Remote `scp -f`: streams files out of the in-memory filesystem. Each
/// `\0` from the client releases the next frame.
struct ScpSource {
    tx: Option<UnboundedSender<ChannelEvent>>,
    frames: VecDeque<Vec<u8>>,
    status: u32,
}

impl ScpSource {
    fn new(
        remote: &MockRemote,
        tx: UnboundedSender<ChannelEvent>,
        target: &str,
        recursive: bool,
    ) -> Self {
        let mut frames = VecDeque::new();
        let mut status = 0;

        if let Some(content) = remote.file(target) {
            push_file(&mut frames, name_of(target), &content);
        } else if remote.is_dir(target) && recursive {
            push_dir(remote, &mut frames, target);
        } else if remote.is_dir(target) {
            frames.push_back(format!("\x01scp: {}: not a regular file\n", target).into_bytes());
            status = 1;
        } else {
            frames.push_back(
                format!("\x01scp: {}: No such file or directory\n", target).into_bytes(),
            );
            status = 1;
        }

        Self {
            tx: Some(tx),
            frames,
            status,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        for _ in data.iter().filter(|b| **b == 0) {
            let Some(tx) = &self.tx else { return };
            match self.frames.pop_front() {
                Some(frame) => {
                    let _ = tx.send(ChannelEvent::Stdout(frame));
                }
                None => {
                    let _ = tx.send(ChannelEvent::ExitStatus(self.status));
                    let _ = tx.send(ChannelEvent::Eof);
                    self.tx = None;
                }
            }
        }
    }
}

fn push_file(frames: &mut VecDeque<Vec<u8>>, name: &str, content: &[u8]) {
    frames.push_back(format!("C0644 {} {}\n", content.len(), name).into_bytes());
    let mut body = content.to_vec();
    body.push(0);
    frames.push_back(body);
}

fn push_dir(remote: &MockRemote, frames: &mut VecDeque<Vec<u8>>, dir: &str) {
    frames.push_back(format!("D0755 0 {}\n", name_of(dir)).into_bytes());
    for (path, node) in remote.children(dir) {
        match node {
            Node::File(content) => push_file(frames, name_of(&path), &content),
            Node::Dir => push_dir(remote, frames, &path),
        }
    }
    frames.push_back(b"E\n".to_vec());
}
