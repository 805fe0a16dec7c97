//! SSH client handler implementation
//!
//! Implements `russh::client::Handler`: server keys are looked up in the known
//! hosts store first, and unknown keys go through the [`HostKeyPolicy`].

use std::sync::{Arc, Mutex};

use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::ssh::host_key::{HostKeyInfo, HostKeyPolicy};
use crate::ssh::known_hosts::{HostKeyStatus, KnownHosts};

/// SSH client handler for russh
pub struct ClientHandler {
    host: String,
    port: u16,
    host_key_checking: bool,
    policy: Arc<HostKeyPolicy>,
    known_hosts: Arc<Mutex<KnownHosts>>,
}

impl ClientHandler {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        host_key_checking: bool,
        policy: Arc<HostKeyPolicy>,
        known_hosts: Arc<Mutex<KnownHosts>>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            host_key_checking,
            policy,
            known_hosts,
        }
    }
}

/// Describe a server key the way it is shown to operators and stored on disk
pub fn host_key_info(host: &str, port: u16, key: &PublicKey, message: &str) -> HostKeyInfo {
    HostKeyInfo {
        hostname: host.to_string(),
        port,
        key_type: key.algorithm().as_str().to_string(),
        fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        message: message.to_string(),
        public_key: key.public_key_base64(),
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.host_key_checking {
            debug!("Host key checking disabled, accepting key for {}", self.host);
            return Ok(true);
        }

        let info = host_key_info(&self.host, self.port, server_public_key, "host key is unknown");
        let status = self
            .known_hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(&self.host, self.port, &info.key_type, &info.public_key);

        match status {
            HostKeyStatus::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyStatus::Changed => Err(TransportError::AuthenticityRejected {
                host: info.hostname,
                key_type: info.key_type,
                fingerprint: info.fingerprint,
                reason: "host key has changed; possible man-in-the-middle attack".to_string(),
            }),
            HostKeyStatus::Unknown => {
                self.policy.verify(&info).await?;
                Ok(true)
            }
        }
    }
}
