//! SSH transport module
//!
//! Cached, authenticated sessions keyed by remote address and user, command
//! execution with privilege-escalation negotiation, and SFTP/SCP transfers.

pub mod backend;
pub mod cache;
pub mod command;
pub mod config;
pub mod connection;
pub mod elevation;
pub mod host_key;
pub mod known_hosts;
pub mod proxy;
#[cfg(feature = "russh")]
pub mod russh_backend;
pub mod ssh_config;
pub mod transfer;

// Re-exports
pub use backend::{default_backend, BackendVersion, ConnectRequest, SshBackend};
pub use cache::{ConnectionCache, ConnectionIdentity};
pub use command::{ExecutionResult, PromptState};
pub use config::{ConnectionOptions, OptionLookup};
pub use connection::{ConnectionState, SshConnection};
pub use elevation::{escape_for_shell, sanitize_password, Escalation, SudoEscalation};
pub use host_key::{HostKeyDecision, HostKeyInfo, HostKeyPolicy, Prompter, StdinPrompter};
pub use known_hosts::{HostKeyStatus, KnownHosts};
pub use proxy::resolve_proxy_command;
pub use transfer::TransferProtocol;
