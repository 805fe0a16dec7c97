//! Error types for the SSH transport

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the SSH transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// No SSH backend compiled in, or the backend is too old for a requested feature
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Session establishment or channel-open failure
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication failed (password, key, or keyboard-interactive)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Host key rejected by policy or by the user
    #[error(
        "Host key for '{host}' rejected ({reason}). The {key_type} key fingerprint is {fingerprint}."
    )]
    AuthenticityRejected {
        host: String,
        key_type: String,
        fingerprint: String,
        reason: String,
    },

    /// Local file missing
    #[error("file or module does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    /// SFTP/SCP I/O failure
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Unknown transfer protocol
    #[error("Don't know how to transfer file over protocol {0}")]
    UnsupportedProtocol(String),

    /// Requested feature not provided by this transport
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Privilege escalation failed
    #[error("Privilege escalation failed: {0}")]
    Escalation(String),

    /// Timed out waiting for privilege escalation; carries the output seen so far
    #[error("ssh timed out waiting for privilege escalation.\n{output}")]
    Timeout { output: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH key parsing error
    #[error("SSH key error: {0}")]
    SshKey(String),
}

/// Result type alias using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a connection error from a string
    pub fn connection(msg: impl Into<String>) -> Self {
        TransportError::Connection(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        TransportError::Authentication(msg.into())
    }

    /// Create a missing dependency error from a string
    pub fn missing_dependency(msg: impl Into<String>) -> Self {
        TransportError::MissingDependency(msg.into())
    }

    /// Create a transfer error from a string
    pub fn transfer(msg: impl Into<String>) -> Self {
        TransportError::TransferFailed(msg.into())
    }

    /// Create an escalation error from a string
    pub fn escalation(msg: impl Into<String>) -> Self {
        TransportError::Escalation(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }
}

#[cfg(feature = "russh")]
impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

#[cfg(feature = "russh")]
impl From<russh::keys::Error> for TransportError {
    fn from(err: russh::keys::Error) -> Self {
        TransportError::SshKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Connection("failed to connect".to_string());
        assert_eq!(err.to_string(), "SSH connection error: failed to connect");

        let err = TransportError::UnsupportedProtocol("ftp".to_string());
        assert_eq!(
            err.to_string(),
            "Don't know how to transfer file over protocol ftp"
        );
    }

    #[test]
    fn test_authenticity_message_names_key() {
        let err = TransportError::AuthenticityRejected {
            host: "web01".to_string(),
            key_type: "ssh-ed25519".to_string(),
            fingerprint: "SHA256:abc".to_string(),
            reason: "host connection rejected by user".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("web01"));
        assert!(msg.contains("ssh-ed25519"));
        assert!(msg.contains("SHA256:abc"));
    }

    #[test]
    fn test_timeout_carries_output() {
        let err = TransportError::Timeout {
            output: "[sudo] password".to_string(),
        };
        assert!(err.to_string().ends_with("\n[sudo] password"));
    }
}
