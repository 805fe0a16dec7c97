//! SSH Transport - remote command execution and file transfer over SSH
//!
//! This crate connects to remote hosts through a compiled-in SSH library,
//! caches one authenticated session per (address, user), runs commands with
//! optional `sudo` escalation and copies files over SFTP or SCP.
//!
//! # Features
//!
//! - Process-wide connection cache shared by every [`SshConnection`]
//! - Host key checking with known_hosts persistence and interactive confirmation
//! - ProxyCommand from options or legacy ssh argument strings
//! - Privilege escalation prompt negotiation with a per-command timeout
//! - SFTP and SCP transfers
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! ssh-transport --host=192.168.1.100 --user=admin exec 'uname -a'
//! ssh-transport --host=web1 --become --become-password=secret exec 'id -u'
//! ssh-transport --host=web1 put ./app.conf /etc/app.conf --proto scp
//! ```
//!
//! # Example Usage (library)
//!
//! ```no_run
//! use ssh_transport::ssh::{ConnectionOptions, SshConnection};
//!
//! # async fn run() -> ssh_transport::Result<()> {
//! let conn = SshConnection::new(ConnectionOptions::new("web1").with_user("deploy"));
//! let result = conn.exec_command("uptime", None, false).await?;
//! println!("{}", result.stdout_lossy());
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ssh;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience
pub use config::{Args, BecomeConfig, Config, Operation, Task};
pub use error::{Result, TransportError};
pub use ssh::{
    ConnectionCache, ConnectionIdentity, ConnectionOptions, ExecutionResult, SshConnection,
    SudoEscalation, TransferProtocol,
};
