//! russh implementation of the backend traits
//!
//! Handles everything library specific: reading the OpenSSH client config,
//! known hosts, the proxy transport, and the authentication sequence.

mod channel;
mod handler;
mod scp;
mod sftp;
mod stream;

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::ssh::backend::{
    BackendVersion, ConnectRequest, ExecChannel, RemoteSession, ScpClient, SftpClient, SshBackend,
};
use crate::ssh::host_key::HostKeyPolicy;
use crate::ssh::known_hosts::KnownHosts;
use crate::ssh::proxy::substitute_placeholders;
use crate::ssh::ssh_config::SshConfigFile;

pub use channel::RusshChannel;
pub use handler::{host_key_info, ClientHandler};
pub use scp::RusshScp;
pub use sftp::RusshSftp;
pub use stream::ProxyStream;

/// Feature level of this backend. Prompt matching for keyboard-interactive
/// authentication is implemented here, so custom password prompts work.
pub const RUSSH_BACKEND_VERSION: BackendVersion = BackendVersion::new(1, 0, 0);

/// Prompt text answered with the password when none is configured
const DEFAULT_PASSWORD_PROMPT: &str = "password";

/// Keyboard-interactive rounds before giving up
const MAX_KBI_ROUNDS: usize = 5;

/// Keys tried when `look_for_keys` is set, in order
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

#[derive(Debug, Default)]
pub struct RusshBackend;

impl RusshBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Where to connect after applying the OpenSSH client config
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    identity_files: Vec<PathBuf>,
    proxy_command: Option<String>,
}

async fn resolve_target(request: &ConnectRequest) -> Result<Target> {
    let mut target = Target {
        host: request.host.clone(),
        port: request.port,
        identity_files: Vec::new(),
        proxy_command: request.proxy_command.clone(),
    };

    let Some(path) = &request.config_file else {
        return Ok(target);
    };

    let settings = SshConfigFile::load(path).await?.resolve(&request.host);
    trace_detail(
        request.verbose,
        format_args!("SSH config settings for {}: {:?}", request.host, settings),
    );

    if let Some(hostname) = settings.hostname {
        target.host = hostname.to_lowercase();
    }
    // An explicit port wins over the config file
    if request.port == crate::ssh::config::DEFAULT_PORT {
        if let Some(port) = settings.port {
            target.port = port;
        }
    }
    if target.proxy_command.is_none() {
        target.proxy_command = settings
            .proxy_command
            .map(|cmd| substitute_placeholders(&cmd, &target.host, target.port, &request.user));
    }
    target.identity_files = settings.identity_files;

    Ok(target)
}

fn client_config(request: &ConnectRequest) -> client::Config {
    let mut config = client::Config::default();

    if let Some(hostkeys) = &request.hostkeys {
        let algorithms = parse_algorithms(hostkeys);
        if algorithms.is_empty() {
            warn!("No usable host key algorithms in '{}', using defaults", hostkeys);
        } else {
            config.preferred.key = Cow::Owned(algorithms);
        }
    }

    config
}

/// Comma separated algorithm names; unknown names are skipped
fn parse_algorithms(list: &str) -> Vec<Algorithm> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match Algorithm::from_str(name) {
            Ok(algorithm) => Some(algorithm),
            Err(_) => {
                warn!("Ignoring unknown key algorithm '{}'", name);
                None
            }
        })
        .collect()
}

/// RSA signature hash allowed by an accepted-algorithms list, strongest first.
/// `None` when the list allows no RSA signature at all.
fn rsa_hash_from_algorithms(list: &str) -> Option<Option<HashAlg>> {
    let names: Vec<&str> = list.split(',').map(str::trim).collect();
    if names.contains(&"rsa-sha2-512") {
        Some(Some(HashAlg::Sha512))
    } else if names.contains(&"rsa-sha2-256") {
        Some(Some(HashAlg::Sha256))
    } else if names.contains(&"ssh-rsa") {
        Some(None)
    } else {
        None
    }
}

/// Whether a keyboard-interactive prompt is asking for the password
/// Connection and authentication detail: info for verbose requests, debug otherwise
fn trace_detail(verbose: bool, message: std::fmt::Arguments<'_>) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

fn matches_password_prompt(prompt: &str, expected: Option<&str>) -> bool {
    let expected = expected.unwrap_or(DEFAULT_PASSWORD_PROMPT).to_lowercase();
    prompt.to_lowercase().contains(&expected)
}

async fn open_transport(
    request: &ConnectRequest,
    target: &Target,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client_config(request));

    let connecting = async {
        match &target.proxy_command {
            Some(command) => {
                let stream = ProxyStream::spawn(command).map_err(|e| {
                    TransportError::connection(format!("failed to start proxy command: {}", e))
                })?;
                client::connect_stream(config, stream, handler).await
            }
            None => client::connect(config, (target.host.as_str(), target.port), handler).await,
        }
    };

    match timeout(request.timeout, connecting).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                "SSH connection timeout after {}s",
                request.timeout.as_secs()
            );
            Err(TransportError::connection(format!(
                "Connection timeout after {}s",
                request.timeout.as_secs()
            )))
        }
    }
}

struct Authenticator<'a> {
    handle: &'a mut Handle<ClientHandler>,
    request: &'a ConnectRequest,
}

impl Authenticator<'_> {
    /// Explicit key, then discovered keys, then password, then keyboard-interactive
    async fn run(&mut self, identity_files: &[PathBuf]) -> Result<()> {
        let request = self.request;

        if let Some(key_bytes) = &request.private_key {
            let key = russh::keys::decode_secret_key(
                &String::from_utf8_lossy(key_bytes),
                request.password.as_deref(),
            )
            .map_err(|e| TransportError::SshKey(format!("Failed to parse private key: {}", e)))?;
            if self.try_key(key).await? {
                info!("Key authentication successful");
                return Ok(());
            }
        }

        if request.look_for_keys {
            for path in identity_files.iter().cloned().chain(default_identity_paths()) {
                let Some(key) = load_identity(&path, request.password.as_deref()) else {
                    continue;
                };
                if self.try_key(key).await? {
                    info!("Key authentication successful with {}", path.display());
                    return Ok(());
                }
            }
        }

        if let Some(password) = &request.password {
            trace_detail(
                request.verbose,
                format_args!("Attempting password authentication for user '{}'", request.user),
            );
            let result = self
                .handle
                .authenticate_password(&request.user, password)
                .await
                .map_err(|e| TransportError::auth(e.to_string()))?;
            if result.success() {
                info!("Password authentication successful");
                return Ok(());
            }

            if self.keyboard_interactive(password).await? {
                info!("Keyboard-interactive authentication successful");
                return Ok(());
            }
        }

        Err(TransportError::auth(format!(
            "all authentication methods failed for user '{}'",
            request.user
        )))
    }

    async fn try_key(&mut self, key: PrivateKey) -> Result<bool> {
        let request = self.request;
        let hash = if key.algorithm().is_rsa() {
            match &request.publickey_accepted_algorithms {
                Some(list) => match rsa_hash_from_algorithms(list) {
                    Some(hash) => hash,
                    None => {
                        trace_detail(
                            request.verbose,
                            format_args!("RSA keys not accepted by '{}', skipping", list),
                        );
                        return Ok(false);
                    }
                },
                None => self
                    .handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| TransportError::auth(e.to_string()))?
                    .flatten(),
            }
        } else {
            None
        };

        trace_detail(
            request.verbose,
            format_args!(
                "Attempting {} key authentication for user '{}'",
                key.algorithm().as_str(),
                request.user
            ),
        );
        let result = self
            .handle
            .authenticate_publickey(
                &request.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await
            .map_err(|e| TransportError::auth(e.to_string()))?;
        Ok(result.success())
    }

    /// Answer every prompt that looks like a password prompt with the password
    async fn keyboard_interactive(&mut self, password: &str) -> Result<bool> {
        let request = self.request;
        let expected = request.password_prompt.as_deref();
        let mut response = self
            .handle
            .authenticate_keyboard_interactive_start(&request.user, None::<String>)
            .await
            .map_err(|e| TransportError::auth(e.to_string()))?;

        for _ in 0..MAX_KBI_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    trace_detail(
                        request.verbose,
                        format_args!("Keyboard-interactive round with {} prompts", prompts.len()),
                    );
                    let answers = prompts
                        .iter()
                        .map(|p| {
                            if matches_password_prompt(&p.prompt, expected) {
                                password.to_string()
                            } else {
                                String::new()
                            }
                        })
                        .collect();
                    response = self
                        .handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| TransportError::auth(e.to_string()))?;
                }
            }
        }

        warn!("Giving up keyboard-interactive after {} rounds", MAX_KBI_ROUNDS);
        Ok(false)
    }
}

fn default_identity_paths() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| {
            DEFAULT_IDENTITIES
                .iter()
                .map(|name| home.join(".ssh").join(name))
                .collect()
        })
        .unwrap_or_default()
}

fn load_identity(path: &Path, passphrase: Option<&str>) -> Option<PrivateKey> {
    if !path.exists() {
        return None;
    }
    match russh::keys::load_secret_key(path, passphrase) {
        Ok(key) => Some(key),
        Err(e) => {
            debug!("Skipping key {}: {}", path.display(), e);
            None
        }
    }
}

#[async_trait]
impl SshBackend for RusshBackend {
    fn name(&self) -> &str {
        "russh"
    }

    fn version(&self) -> BackendVersion {
        RUSSH_BACKEND_VERSION
    }

    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn RemoteSession>> {
        let target = resolve_target(&request).await?;
        info!(
            "Connecting to SSH server {}:{}{}",
            target.host,
            target.port,
            if target.proxy_command.is_some() { " via proxy command" } else { "" }
        );

        let known_hosts_path = match &request.known_hosts_file {
            Some(path) => path.clone(),
            None => KnownHosts::default_path()
                .ok_or_else(|| TransportError::config("cannot locate the home directory"))?,
        };
        let known_hosts = Arc::new(Mutex::new(KnownHosts::load(known_hosts_path)?));

        let handler = ClientHandler::new(
            target.host.clone(),
            target.port,
            request.host_key_checking,
            request.host_key_policy.clone(),
            known_hosts.clone(),
        );

        let mut handle = open_transport(&request, &target, handler).await?;

        Authenticator {
            handle: &mut handle,
            request: &request,
        }
        .run(&target.identity_files)
        .await?;

        info!(
            "Successfully connected to {}@{}:{}",
            request.user, target.host, target.port
        );

        let session: Arc<dyn RemoteSession> = Arc::new(RusshSession {
            handle,
            closed: AtomicBool::new(false),
            policy: request.host_key_policy.clone(),
            known_hosts,
        });
        Ok(session)
    }
}

pub struct RusshSession {
    handle: Handle<ClientHandler>,
    closed: AtomicBool,
    policy: Arc<HostKeyPolicy>,
    known_hosts: Arc<Mutex<KnownHosts>>,
}

impl RusshSession {
    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::connection(format!("Failed to open channel: {}", e)))
    }

    /// Write keys accepted during this session to the known hosts file
    fn persist_host_keys(&self) -> Result<()> {
        if !self.policy.host_key_checking() {
            return Ok(());
        }

        let trusted = self.policy.trusted_keys();
        if trusted.is_empty() {
            return Ok(());
        }

        let mut known_hosts = self.known_hosts.lock().unwrap_or_else(|e| e.into_inner());
        for key in &trusted {
            known_hosts.add(&key.hostname, key.port, &key.key_type, &key.public_key);
        }
        known_hosts.save()?;
        info!(
            "Saved {} host key(s) to {}",
            trusted.len(),
            known_hosts.path().display()
        );
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    async fn new_channel(&self) -> Result<Box<dyn ExecChannel>> {
        let channel = self.open_channel().await?;
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn sftp(&self) -> Result<Arc<dyn SftpClient>> {
        let channel = self.open_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        debug!("SFTP subsystem started");

        let sftp: Arc<dyn SftpClient> = Arc::new(RusshSftp::new(session));
        Ok(sftp)
    }

    async fn scp(&self) -> Result<Box<dyn ScpClient>> {
        let channel = self.open_channel().await?;
        Ok(Box::new(RusshScp::new(channel)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.persist_host_keys()?;

        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await?;
        debug!("SSH session disconnected");
        Ok(())
    }
}
