//! SSH library seam
//!
//! The connection, executor and transfer code talk to the SSH library only
//! through these traits. The russh implementation lives in
//! [`russh_backend`](super::russh_backend); tests use an in-memory one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::command::ExecutionResult;
use super::host_key::HostKeyPolicy;
use crate::error::Result;

/// Oldest library version that can match a custom password prompt
pub const MIN_PASSWORD_PROMPT_VERSION: BackendVersion = BackendVersion::new(1, 0, 0);

/// Library version as `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BackendVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Everything the library needs to open and authenticate one session
#[derive(Clone)]
pub struct ConnectRequest {
    /// Lowercased host name or address
    pub host: String,
    pub port: u16,
    pub user: String,
    pub look_for_keys: bool,
    pub host_key_checking: bool,
    pub password: Option<String>,
    pub password_prompt: Option<String>,
    /// Raw private key file contents
    pub private_key: Option<Vec<u8>>,
    pub timeout: Duration,
    pub proxy_command: Option<String>,
    pub config_file: Option<PathBuf>,
    pub publickey_accepted_algorithms: Option<String>,
    pub hostkeys: Option<String>,
    pub known_hosts_file: Option<PathBuf>,
    /// Log connection and authentication detail at info instead of debug
    pub verbose: bool,
    /// Consulted for host keys missing from the known hosts store
    pub host_key_policy: Arc<HostKeyPolicy>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("look_for_keys", &self.look_for_keys)
            .field("host_key_checking", &self.host_key_checking)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_prompt", &self.password_prompt)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("proxy_command", &self.proxy_command)
            .field("config_file", &self.config_file)
            .field(
                "publickey_accepted_algorithms",
                &self.publickey_accepted_algorithms,
            )
            .field("hostkeys", &self.hostkeys)
            .field("known_hosts_file", &self.known_hosts_file)
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// A compiled-in SSH library
#[async_trait]
pub trait SshBackend: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> BackendVersion;

    /// Open and authenticate a session
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn RemoteSession>>;
}

/// An open, authenticated session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// True once the transport is gone; such a session must not be reused
    fn is_closed(&self) -> bool;

    async fn new_channel(&self) -> Result<Box<dyn ExecChannel>>;

    async fn sftp(&self) -> Result<Arc<dyn SftpClient>>;

    async fn scp(&self) -> Result<Box<dyn ScpClient>>;

    /// Disconnect and persist host keys accepted during the session
    async fn close(&self) -> Result<()>;
}

/// Exit data collected after a command has been started with [`ExecChannel::start`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelExit {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ChannelExit {
    /// Exit status as a return code: -1 when none was reported, saturating
    /// at `i32::MAX`
    pub fn return_code(&self) -> i32 {
        self.exit_status
            .map_or(-1, |status| i32::try_from(status).unwrap_or(i32::MAX))
    }
}

/// One command-execution stream
#[async_trait]
pub trait ExecChannel: Send {
    async fn request_pty(&mut self) -> Result<()>;

    /// Start `command` without waiting for it, for interactive negotiation
    async fn start(&mut self, command: &[u8]) -> Result<()>;

    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Up to `max` bytes of output. Empty once the remote side closed.
    async fn recv(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Run `command` to completion
    async fn exec(&mut self, command: &str) -> Result<ExecutionResult>;

    /// Drain the rest of a started command and collect its exit status
    async fn finish(&mut self) -> Result<ChannelExit>;

    async fn close(&mut self) -> Result<()>;
}

/// SFTP handle. I/O failures keep their `io::Error` so callers can word them.
#[async_trait]
pub trait SftpClient: Send + Sync {
    async fn put(&self, local: &Path, remote: &str) -> std::io::Result<()>;

    async fn get(&self, remote: &str, local: &Path) -> std::io::Result<()>;

    async fn close(&self) -> Result<()>;
}

/// SCP handle, used for a single transfer
#[async_trait]
pub trait ScpClient: Send {
    async fn put(&mut self, local: &Path, remote: &str) -> std::io::Result<()>;

    async fn get(&mut self, remote: &str, local: &Path) -> std::io::Result<()>;
}

/// The library compiled into this build, if any
pub fn default_backend() -> Option<Arc<dyn SshBackend>> {
    #[cfg(feature = "russh")]
    {
        Some(Arc::new(super::russh_backend::RusshBackend::new()))
    }

    #[cfg(not(feature = "russh"))]
    {
        None
    }
}
