//! SFTP handle over russh-sftp

use std::io;
use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::ssh::backend::SftpClient;

pub struct RusshSftp {
    session: Mutex<Option<SftpSession>>,
}

impl RusshSftp {
    pub fn new(session: SftpSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

fn sftp_error(e: russh_sftp::client::error::Error) -> io::Error {
    io::Error::other(e.to_string())
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "SFTP session is closed")
}

#[async_trait]
impl SftpClient for RusshSftp {
    async fn put(&self, local: &Path, remote: &str) -> io::Result<()> {
        let guard = self.session.lock().await;
        let sftp = guard.as_ref().ok_or_else(closed)?;

        let mut source = tokio::fs::File::open(local).await?;
        let mut target = sftp.create(remote).await.map_err(sftp_error)?;
        let copied = tokio::io::copy(&mut source, &mut target).await?;
        target.shutdown().await?;

        debug!("SFTP put {} bytes to {}", copied, remote);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> io::Result<()> {
        let guard = self.session.lock().await;
        let sftp = guard.as_ref().ok_or_else(closed)?;

        let mut source = sftp.open(remote).await.map_err(sftp_error)?;
        let mut target = tokio::fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut source, &mut target).await?;
        target.flush().await?;

        debug!("SFTP got {} bytes from {}", copied, remote);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping the session closes its channel
        self.session.lock().await.take();
        Ok(())
    }
}
