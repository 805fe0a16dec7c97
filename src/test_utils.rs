//! In-memory SSH library for tests
//!
//! [`MockBackend`] hands out sessions whose channels replay a [`ChannelScript`]
//! and whose SFTP/SCP handles read and write a shared map of remote files.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::ssh::backend::{
    BackendVersion, ChannelExit, ConnectRequest, ExecChannel, RemoteSession, ScpClient,
    SftpClient, SshBackend,
};
use crate::ssh::command::ExecutionResult;
use crate::ssh::elevation::Escalation;
use crate::ssh::host_key::{HostKeyInfo, Prompter};

/// What the next opened channel does
#[derive(Debug, Clone, Default)]
pub struct ChannelScript {
    /// Chunks returned by `recv`, then an empty read (closed)
    pub chunks: Vec<Vec<u8>>,
    /// Block in `recv` once the chunks are used up
    pub hang: bool,
    /// Block in `finish`
    pub hang_on_finish: bool,
    pub exit_status: Option<u32>,
    /// Output returned by `finish`
    pub tail_stdout: Vec<u8>,
    pub exec_result: ExecutionResult,
}

/// What happened on the last opened channel
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    pub pty: bool,
    pub started: Option<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub exec: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    sftp_opens: AtomicUsize,
    scp_opens: AtomicUsize,
    fail_connect: Mutex<Option<String>>,
    fail_channel: Mutex<Option<String>>,
    fail_sftp: AtomicBool,
    host_key: Mutex<Option<HostKeyInfo>>,
    requests: Mutex<Vec<ConnectRequest>>,
    script: Mutex<ChannelScript>,
    log: Arc<Mutex<ChannelLog>>,
    channel_closes: Arc<AtomicUsize>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

pub struct MockBackend {
    version: BackendVersion,
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Self::with_version(BackendVersion::new(1, 0, 0))
    }

    pub fn with_version(version: BackendVersion) -> Arc<Self> {
        Arc::new(Self {
            version,
            state: Arc::new(MockState::default()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> Option<Arc<dyn SshBackend>> {
        let backend: Arc<dyn SshBackend> = self.clone();
        Some(backend)
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn sftp_opens(&self) -> usize {
        self.state.sftp_opens.load(Ordering::SeqCst)
    }

    pub fn scp_opens(&self) -> usize {
        self.state.scp_opens.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ConnectRequest> {
        self.state.requests.lock().unwrap().last().cloned()
    }

    pub fn fail_connect(&self, msg: &str) {
        *self.state.fail_connect.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_channel_open(&self, msg: &str) {
        *self.state.fail_channel.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_sftp_open(&self) {
        self.state.fail_sftp.store(true, Ordering::SeqCst);
    }

    /// Run every connect through the host key policy with this key
    pub fn present_host_key(&self, key: HostKeyInfo) {
        *self.state.host_key.lock().unwrap() = Some(key);
    }

    pub fn script_channel(&self, script: ChannelScript) {
        *self.state.script.lock().unwrap() = script;
    }

    pub fn channel_log(&self) -> ChannelLog {
        self.state.log.lock().unwrap().clone()
    }

    /// Channels closed so far, across all sessions
    pub fn channel_closes(&self) -> usize {
        self.state.channel_closes.load(Ordering::SeqCst)
    }

    pub fn put_remote_file(&self, path: &str, content: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(path).cloned()
    }

    /// Simulate the server dropping every open session
    pub fn drop_sessions(&self) {
        for session in self.state.sessions.lock().unwrap().iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }

    /// An SFTP handle whose `close` fails
    pub fn failing_sftp(&self) -> Arc<dyn SftpClient> {
        Arc::new(MockSftp {
            state: self.state.clone(),
            fail_close: true,
        })
    }
}

#[async_trait]
impl SshBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn version(&self) -> BackendVersion {
        self.version
    }

    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn RemoteSession>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(msg) = self.state.fail_connect.lock().unwrap().clone() {
            return Err(TransportError::connection(msg));
        }

        let key = self.state.host_key.lock().unwrap().clone();
        if let Some(key) = key {
            request.host_key_policy.verify(&key).await?;
        }

        self.state.requests.lock().unwrap().push(request);
        let session = Arc::new(MockSession {
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        });
        self.state.sessions.lock().unwrap().push(session.clone());
        Ok(session as Arc<dyn RemoteSession>)
    }
}

pub struct MockSession {
    closed: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn new_channel(&self) -> Result<Box<dyn ExecChannel>> {
        if let Some(msg) = self.state.fail_channel.lock().unwrap().clone() {
            return Err(TransportError::connection(msg));
        }

        let script = self.state.script.lock().unwrap().clone();
        *self.state.log.lock().unwrap() = ChannelLog::default();
        Ok(Box::new(MockChannel {
            chunks: script.chunks.clone().into(),
            script,
            log: self.state.log.clone(),
            closes: self.state.channel_closes.clone(),
        }))
    }

    async fn sftp(&self) -> Result<Arc<dyn SftpClient>> {
        if self.state.fail_sftp.load(Ordering::SeqCst) {
            return Err(TransportError::connection("subsystem request failed"));
        }
        self.state.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSftp {
            state: self.state.clone(),
            fail_close: false,
        }))
    }

    async fn scp(&self) -> Result<Box<dyn ScpClient>> {
        self.state.scp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockScp {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    chunks: VecDeque<Vec<u8>>,
    script: ChannelScript,
    log: Arc<Mutex<ChannelLog>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecChannel for MockChannel {
    async fn request_pty(&mut self) -> Result<()> {
        self.log.lock().unwrap().pty = true;
        Ok(())
    }

    async fn start(&mut self, command: &[u8]) -> Result<()> {
        self.log.lock().unwrap().started = Some(command.to_vec());
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.log.lock().unwrap().sent.push(data.to_vec());
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        match self.chunks.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max {
                    let rest = chunk.split_off(max);
                    self.chunks.push_front(rest);
                }
                Ok(chunk)
            }
            None if self.script.hang => std::future::pending().await,
            None => Ok(Vec::new()),
        }
    }

    async fn exec(&mut self, command: &str) -> Result<ExecutionResult> {
        self.log.lock().unwrap().exec.push(command.to_string());
        Ok(self.script.exec_result.clone())
    }

    async fn finish(&mut self) -> Result<ChannelExit> {
        if self.script.hang_on_finish {
            std::future::pending::<()>().await;
        }
        Ok(ChannelExit {
            exit_status: self.script.exit_status,
            stdout: self.script.tail_stdout.clone(),
            stderr: Vec::new(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

struct MockSftp {
    state: Arc<MockState>,
    fail_close: bool,
}

#[async_trait]
impl SftpClient for MockSftp {
    async fn put(&self, local: &Path, remote: &str) -> std::io::Result<()> {
        let content = tokio::fs::read(local).await?;
        self.state
            .files
            .lock()
            .unwrap()
            .insert(remote.to_string(), content);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> std::io::Result<()> {
        let content = self.state.files.lock().unwrap().get(remote).cloned();
        match content {
            Some(content) => tokio::fs::write(local, content).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file",
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.fail_close {
            return Err(TransportError::connection("sftp close failed"));
        }
        Ok(())
    }
}

struct MockScp {
    state: Arc<MockState>,
}

#[async_trait]
impl ScpClient for MockScp {
    async fn put(&mut self, local: &Path, remote: &str) -> std::io::Result<()> {
        let content = tokio::fs::read(local).await?;
        self.state
            .files
            .lock()
            .unwrap()
            .insert(remote.to_string(), content);
        Ok(())
    }

    async fn get(&mut self, remote: &str, local: &Path) -> std::io::Result<()> {
        let content = self.state.files.lock().unwrap().get(remote).cloned();
        match content {
            Some(content) => tokio::fs::write(local, content).await,
            None => Err(std::io::Error::other(format!(
                "scp: {}: No such file or directory",
                remote
            ))),
        }
    }
}

/// Escalation double: success marker `BECOME-SUCCESS-`, prompt `[sudo] password`
pub struct ScriptedEscalation {
    user: String,
    secret: Option<String>,
    expects_prompt: bool,
}

impl ScriptedEscalation {
    pub fn prompting(user: &str, secret: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.map(str::to_string),
            expects_prompt: true,
        }
    }

    pub fn non_prompting(user: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: None,
            expects_prompt: false,
        }
    }
}

impl Escalation for ScriptedEscalation {
    fn expects_prompt(&self) -> bool {
        self.expects_prompt
    }

    fn check_success(&self, line: &[u8]) -> bool {
        line.starts_with(b"BECOME-SUCCESS-")
    }

    fn check_password_prompt(&self, line: &[u8]) -> bool {
        line.starts_with(b"[sudo] password")
    }

    fn secret(&self) -> Option<Vec<u8>> {
        self.secret.as_ref().map(|s| s.as_bytes().to_vec())
    }

    fn escalation_user(&self) -> &str {
        &self.user
    }
}

/// Host key prompter returning a fixed answer
pub struct ScriptedPrompter {
    answer: String,
    calls: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn prompt(&self, _message: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}
