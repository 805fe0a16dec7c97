//! SSH connection lifecycle
//!
//! [`SshConnection`] owns connect / reset / close for one
//! [`ConnectionIdentity`]. Sessions are looked up in the injected
//! [`ConnectionCache`] first, so several connections to the same host and user
//! share one transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::backend::{
    default_backend, ConnectRequest, ExecChannel, RemoteSession, SftpClient, SshBackend,
    MIN_PASSWORD_PROMPT_VERSION,
};
use super::cache::{ConnectionCache, ConnectionIdentity};
use super::config::ConnectionOptions;
use super::elevation::Escalation;
use super::host_key::{HostKeyPolicy, Prompter, StdinPrompter};
use super::proxy::resolve_proxy_command;
use crate::error::{Result, TransportError};

/// Lifecycle state of an [`SshConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// One logical connection to a host
pub struct SshConnection {
    options: ConnectionOptions,
    identity: ConnectionIdentity,
    cache: Arc<ConnectionCache>,
    backend: Option<Arc<dyn SshBackend>>,
    prompter: Arc<dyn Prompter>,
    pub(crate) escalation: Option<Arc<dyn Escalation>>,
    force_persistence: bool,

    session: Mutex<Option<Arc<dyn RemoteSession>>>,

    /// Channel of the last executed command
    pub(crate) channel: Mutex<Option<Box<dyn ExecChannel>>>,

    /// SFTP handle of the last transfer
    pub(crate) sftp: Mutex<Option<Arc<dyn SftpClient>>>,

    state: std::sync::Mutex<ConnectionState>,
}

impl SshConnection {
    /// Create a connection using the process-wide cache and the compiled-in library.
    ///
    /// Nothing is opened until [`SshConnection::connect`].
    pub fn new(options: ConnectionOptions) -> Self {
        // Keyed by the user that authenticates, so an unset remote user and
        // an explicit one naming the local user share a session
        let identity = ConnectionIdentity::new(
            options.remote_addr.clone(),
            options.resolved_user().unwrap_or_default(),
        );

        Self {
            options,
            identity,
            cache: ConnectionCache::global(),
            backend: default_backend(),
            prompter: Arc::new(StdinPrompter),
            escalation: None,
            force_persistence: false,
            session: Mutex::new(None),
            channel: Mutex::new(None),
            sftp: Mutex::new(None),
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the SSH library; `None` behaves like a build without one
    pub fn with_backend(mut self, backend: Option<Arc<dyn SshBackend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_escalation(mut self, escalation: Arc<dyn Escalation>) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// Treat the connection as persistent even if the options do not say so
    pub fn with_force_persistence(mut self, force: bool) -> Self {
        self.force_persistence = force;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Get the cached session for this identity, or open a new one.
    pub async fn connect(&self) -> Result<Arc<dyn RemoteSession>> {
        let sessions = self.cache.sessions();

        if let Some(existing) = sessions.get(&self.identity) {
            if existing.is_closed()
                && self.cache.evict_session_if(&self.identity, |s| s.is_closed())
            {
                warn!("Cached session for {} is closed, reconnecting", self.identity);
            }
        }

        self.set_state(ConnectionState::Connecting);
        let result = sessions
            .get_or_try_insert_with(&self.identity, || self.connect_uncached())
            .await;

        match result {
            Ok(session) => {
                *self.session.lock().await = Some(session.clone());
                self.set_state(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Open and authenticate a fresh session, bypassing the cache
    pub async fn connect_uncached(&self) -> Result<Arc<dyn RemoteSession>> {
        let backend = self.backend.clone().ok_or_else(|| {
            TransportError::missing_dependency(
                "no SSH library is available; rebuild with the `russh` feature",
            )
        })?;
        info!("USING {} VERSION {}", backend.name(), backend.version());

        let user = match self.identity.remote_user.as_str() {
            "" => self.options.resolved_user()?,
            user => user.to_string(),
        };
        let addr = self.options.remote_addr.clone();
        let port = self.options.port();
        info!(
            "ESTABLISH SSH CONNECTION FOR USER: {} on PORT {} TO {}",
            user, port, addr
        );

        let verbose = self.options.verbosity > 3;
        let proxy_command = resolve_proxy_command(&self.options, &addr, port, &user);

        let private_key = match &self.options.private_key_file {
            Some(path) => Some(read_private_key(path).await?),
            None => None,
        };

        if self.options.password_prompt.is_some()
            && backend.version() < MIN_PASSWORD_PROMPT_VERSION
        {
            return Err(TransportError::missing_dependency(format!(
                "Configuring password prompt is not supported in {} version {}. Please upgrade to {} {} or newer.",
                backend.name(),
                backend.version(),
                backend.name(),
                MIN_PASSWORD_PROMPT_VERSION
            )));
        }

        let policy = Arc::new(HostKeyPolicy::new(
            self.options.host_key_checking,
            self.options.host_key_auto_add,
            self.options.use_persistent_connections || self.force_persistence,
            self.prompter.clone(),
        ));

        let request = ConnectRequest {
            host: addr.to_lowercase(),
            port,
            user,
            look_for_keys: self.options.look_for_keys,
            host_key_checking: self.options.host_key_checking,
            password: self.options.password.clone(),
            password_prompt: self.options.password_prompt.clone(),
            private_key,
            timeout: self.options.timeout,
            proxy_command,
            config_file: self.options.config_file.clone(),
            publickey_accepted_algorithms: self.options.publickey_accepted_algorithms.clone(),
            hostkeys: self.options.hostkeys.clone(),
            known_hosts_file: self.options.known_hosts_file.clone(),
            verbose,
            host_key_policy: policy,
        };
        debug!("Connect request: {:?}", request);

        match backend.connect(request).await {
            Ok(session) => {
                info!("ssh connection is OK: {}", self.identity);
                Ok(session)
            }
            Err(e) => {
                error!("SSH connection to {} failed: {}", addr, e);
                Err(wrap_connect_error(e))
            }
        }
    }

    /// Current session, connecting if there is none or it has gone away
    pub async fn ensure_connected(&self) -> Result<Arc<dyn RemoteSession>> {
        {
            let guard = self.session.lock().await;
            if let Some(session) = guard.as_ref().filter(|s| !s.is_closed()) {
                return Ok(session.clone());
            }
        }
        self.connect().await
    }

    /// SFTP handle for this identity, cached separately from the session
    pub async fn connect_sftp(&self) -> Result<Arc<dyn SftpClient>> {
        self.cache
            .sftp()
            .get_or_try_insert_with(&self.identity, || async {
                let session = self.ensure_connected().await?;
                session.sftp().await
            })
            .await
    }

    /// Evict this identity from the cache and close the SFTP handle, the last
    /// channel and the session, in that order. The first failure is returned and
    /// the remaining resources are left open.
    pub async fn close(&self) -> Result<()> {
        self.cache.remove(&self.identity);

        if let Some(sftp) = self.sftp.lock().await.take() {
            sftp.close().await?;
        }

        if let Some(mut channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }

        if let Some(session) = self.session.lock().await.take() {
            session.close().await?;
        }

        self.set_state(ConnectionState::Closed);
        info!("SSH connection to {} closed", self.identity);
        Ok(())
    }

    /// Close, then connect again
    pub async fn reset(&self) -> Result<Arc<dyn RemoteSession>> {
        self.close().await?;
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identity", &self.identity)
            .field("port", &self.options.port())
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("state", &self.state())
            .finish()
    }
}

/// Library failures become connection failures carrying the library message.
/// Host key rejections and missing dependencies keep their kind.
fn wrap_connect_error(err: TransportError) -> TransportError {
    match err {
        e @ (TransportError::AuthenticityRejected { .. }
        | TransportError::MissingDependency(_)
        | TransportError::FileNotFound(_)) => e,
        TransportError::Connection(msg) => {
            TransportError::connection(format!("ssh connection failed: {}", msg))
        }
        other => TransportError::connection(other.to_string()),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

async fn read_private_key(path: &Path) -> Result<Vec<u8>> {
    let expanded = expand_home(path);
    debug!("Reading private key from {}", expanded.display());
    tokio::fs::read(&expanded).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TransportError::FileNotFound(expanded.clone()),
        _ => TransportError::Io(e),
    })
}
