//! File transfer over SFTP or SCP

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use super::connection::SshConnection;
use crate::error::{Result, TransportError};

/// Transfer protocol for [`SshConnection::put_file`] / [`SshConnection::fetch_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferProtocol {
    #[default]
    Sftp,
    Scp,
}

impl FromStr for TransferProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sftp" => Ok(Self::Sftp),
            "scp" => Ok(Self::Scp),
            other => Err(TransportError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sftp => write!(f, "sftp"),
            Self::Scp => write!(f, "scp"),
        }
    }
}

impl SshConnection {
    /// Copy a local file to the remote host.
    ///
    /// The local file is checked before anything touches the network. SFTP
    /// opens a fresh handle; SCP opens a fresh handle per call.
    pub async fn put_file(
        &self,
        local: &Path,
        remote: &str,
        protocol: TransferProtocol,
    ) -> Result<()> {
        info!(
            host = %self.options().remote_addr,
            "PUT {} TO {}",
            local.display(),
            remote
        );

        if !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(TransportError::FileNotFound(local.to_path_buf()));
        }

        let session = self.ensure_connected().await?;
        match protocol {
            TransferProtocol::Sftp => {
                let sftp = session.sftp().await.map_err(|e| {
                    TransportError::transfer(format!("failed to open a SFTP connection ({})", e))
                })?;
                *self.sftp.lock().await = Some(sftp.clone());

                sftp.put(local, remote).await.map_err(|e| {
                    TransportError::transfer(format!("failed to transfer file to {}: {}", remote, e))
                })
            }
            TransferProtocol::Scp => {
                let mut scp = session.scp().await?;
                scp.put(local, remote).await.map_err(|e| {
                    TransportError::transfer(format!(
                        "Error transferring file to {}: {}",
                        remote, e
                    ))
                })
            }
        }
    }

    /// Copy a remote file to a local path.
    ///
    /// SFTP reuses the cached handle for this identity. With SCP a missing
    /// remote file can make the server drop the whole connection instead of
    /// failing the transfer cleanly.
    pub async fn fetch_file(
        &self,
        remote: &str,
        local: &Path,
        protocol: TransferProtocol,
    ) -> Result<()> {
        info!(
            host = %self.options().remote_addr,
            "FETCH {} TO {}",
            remote,
            local.display()
        );

        match protocol {
            TransferProtocol::Sftp => {
                let sftp = self.connect_sftp().await.map_err(|e| {
                    TransportError::transfer(format!("failed to open a SFTP connection ({})", e))
                })?;
                *self.sftp.lock().await = Some(sftp.clone());

                sftp.get(remote, local).await.map_err(|e| {
                    TransportError::transfer(format!(
                        "failed to transfer file from {}: {}",
                        remote, e
                    ))
                })
            }
            TransferProtocol::Scp => {
                let session = self.ensure_connected().await?;
                let mut scp = session.scp().await?;
                scp.get(remote, local).await.map_err(|e| {
                    TransportError::transfer(format!(
                        "Error transferring file from {}: {}",
                        remote, e
                    ))
                })
            }
        }
    }
}
