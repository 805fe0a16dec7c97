//! Host key policy
//!
//! Decides what happens to a host key that is not in the known hosts store:
//! accept it silently, reject it, or ask the operator.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

const AUTHENTICITY_QUESTION: &str = "Are you sure you want to continue connecting (yes/no)?";

/// A server host key presented during connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    pub hostname: String,
    pub port: u16,
    /// Algorithm name, e.g. `ssh-ed25519`
    pub key_type: String,
    /// `SHA256:...` fingerprint
    pub fingerprint: String,
    /// Why the key needs a decision, e.g. "host key is unknown"
    pub message: String,
    /// Base64 public key blob as written to known_hosts
    pub public_key: String,
}

impl HostKeyInfo {
    /// Statement about the key, without the yes/no question
    pub fn authenticity_statement(&self) -> String {
        format!(
            "The authenticity of host '{}' can't be established due to '{}'.\nThe {} key fingerprint is {}.",
            self.hostname, self.message, self.key_type, self.fingerprint
        )
    }

    /// Full prompt shown to the operator
    pub fn authenticity_prompt(&self) -> String {
        format!("{}\n{} ", self.authenticity_statement(), AUTHENTICITY_QUESTION)
    }
}

/// Outcome of [`HostKeyPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    Reject,
    AskUser,
}

/// Interactive surface used to confirm unknown host keys
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show `message` and return the operator's raw answer
    async fn prompt(&self, message: &str) -> Result<String>;
}

/// Prompts on stderr and reads one line from stdin
#[derive(Debug, Default, Clone)]
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn prompt(&self, message: &str) -> Result<String> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut stderr = std::io::stderr();
            write!(stderr, "{}", message)?;
            stderr.flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| TransportError::connection(format!("prompt task failed: {}", e)))?
    }
}

/// Decision procedure for unknown host keys
pub struct HostKeyPolicy {
    host_key_checking: bool,
    host_key_auto_add: bool,
    persistent: bool,
    prompter: Arc<dyn Prompter>,
    trusted: Mutex<Vec<HostKeyInfo>>,
}

impl HostKeyPolicy {
    pub fn new(
        host_key_checking: bool,
        host_key_auto_add: bool,
        persistent: bool,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            host_key_checking,
            host_key_auto_add,
            persistent,
            prompter,
            trusted: Mutex::new(Vec::new()),
        }
    }

    pub fn host_key_checking(&self) -> bool {
        self.host_key_checking
    }

    /// Pure decision, no side effects
    pub fn decide(&self, _key: &HostKeyInfo) -> HostKeyDecision {
        if !self.host_key_checking || self.host_key_auto_add {
            HostKeyDecision::Accept
        } else if self.persistent {
            // Nobody can answer a prompt on a persistent connection
            HostKeyDecision::Reject
        } else {
            HostKeyDecision::AskUser
        }
    }

    /// Apply the decision, prompting when needed. Accepted keys are remembered
    /// for [`HostKeyPolicy::trusted_keys`].
    pub async fn verify(&self, key: &HostKeyInfo) -> Result<()> {
        match self.decide(key) {
            HostKeyDecision::Accept => {}
            HostKeyDecision::Reject => {
                warn!("{}", key.authenticity_statement());
                return Err(rejected(key, key.authenticity_statement()));
            }
            HostKeyDecision::AskUser => {
                let answer = self.prompter.prompt(&key.authenticity_prompt()).await?;
                let answer = answer.trim_end_matches(['\r', '\n']);
                if !matches!(answer, "yes" | "y" | "") {
                    return Err(rejected(key, "host connection rejected by user".to_string()));
                }
                info!("Host key for {} accepted by user", key.hostname);
            }
        }

        debug!(
            "Trusting {} key {} for {}",
            key.key_type, key.fingerprint, key.hostname
        );
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());
        Ok(())
    }

    /// Keys accepted during this session, in acceptance order
    pub fn trusted_keys(&self) -> Vec<HostKeyInfo> {
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeyPolicy")
            .field("host_key_checking", &self.host_key_checking)
            .field("host_key_auto_add", &self.host_key_auto_add)
            .field("persistent", &self.persistent)
            .finish()
    }
}

fn rejected(key: &HostKeyInfo, reason: String) -> TransportError {
    TransportError::AuthenticityRejected {
        host: key.hostname.clone(),
        key_type: key.key_type.clone(),
        fingerprint: key.fingerprint.clone(),
        reason,
    }
}
