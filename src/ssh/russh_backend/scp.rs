//! SCP over an exec channel
//!
//! Speaks the sink (`scp -t`) and source (`scp -f`) sides of the rcp protocol
//! for a single regular file.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::ssh::backend::ScpClient;
use crate::ssh::elevation::escape_for_shell;

pub struct RusshScp {
    channel: Option<Channel<Msg>>,
}

impl RusshScp {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    async fn start(&mut self, command: String) -> io::Result<russh::ChannelStream<Msg>> {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| io::Error::other("SCP handle already used"))?;
        debug!("SCP exec: {}", command);
        channel
            .exec(true, command)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(channel.into_stream())
    }
}

/// Read one status byte; 1 (warning) and 2 (fatal) carry a message line
async fn read_ack<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> io::Result<()> {
    let mut status = [0u8; 1];
    reader.read_exact(&mut status).await?;
    match status[0] {
        0 => Ok(()),
        1 | 2 => {
            let mut message = String::new();
            reader.read_line(&mut message).await?;
            Err(io::Error::other(message.trim_end().to_string()))
        }
        other => Err(io::Error::other(format!(
            "unexpected SCP response byte {:#04x}",
            other
        ))),
    }
}

/// Parse `C<mode> <size> <name>`
fn parse_file_header(line: &str) -> io::Result<u64> {
    let rest = line
        .strip_prefix('C')
        .ok_or_else(|| io::Error::other(format!("unexpected SCP header: {}", line.trim_end())))?;
    let mut parts = rest.split_whitespace();
    let _mode = parts.next();
    parts
        .next()
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| io::Error::other(format!("invalid SCP header: {}", line.trim_end())))
}

fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }

    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

async fn send_file<S>(stream: S, local: &Path, remote: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(local).await?;
    let metadata = file.metadata().await?;
    let name = Path::new(remote)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| remote.to_string());

    let mut stream = BufReader::new(stream);
    read_ack(&mut stream).await?;

    let header = format!("C{:04o} {} {}\n", file_mode(&metadata), metadata.len(), name);
    stream.get_mut().write_all(header.as_bytes()).await?;
    read_ack(&mut stream).await?;

    tokio::io::copy(&mut file, stream.get_mut()).await?;
    stream.get_mut().write_all(&[0]).await?;
    stream.get_mut().flush().await?;
    read_ack(&mut stream).await?;

    stream.get_mut().shutdown().await?;
    Ok(())
}

async fn receive_file<S>(stream: S, local: &Path) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(&[0]).await?;
    stream.get_mut().flush().await?;

    let mut header = String::new();
    loop {
        header.clear();
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await?;
        match first[0] {
            1 | 2 => {
                let mut message = String::new();
                stream.read_line(&mut message).await?;
                return Err(io::Error::other(message.trim_end().to_string()));
            }
            b'T' => {
                // Timestamps, acknowledge and keep going
                stream.read_line(&mut header).await?;
                stream.get_mut().write_all(&[0]).await?;
                stream.get_mut().flush().await?;
            }
            byte => {
                header.push(byte as char);
                stream.read_line(&mut header).await?;
                break;
            }
        }
    }

    let size = parse_file_header(&header)?;
    stream.get_mut().write_all(&[0]).await?;
    stream.get_mut().flush().await?;

    let mut file = tokio::fs::File::create(local).await?;
    let copied = tokio::io::copy(&mut (&mut stream).take(size), &mut file).await?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("SCP stream ended after {} of {} bytes", copied, size),
        ));
    }
    file.flush().await?;

    read_ack(&mut stream).await?;
    stream.get_mut().write_all(&[0]).await?;
    stream.get_mut().shutdown().await?;
    Ok(())
}

#[async_trait]
impl ScpClient for RusshScp {
    async fn put(&mut self, local: &Path, remote: &str) -> io::Result<()> {
        let stream = self
            .start(format!("scp -t '{}'", escape_for_shell(remote)))
            .await?;
        send_file(stream, local, remote).await
    }

    async fn get(&mut self, remote: &str, local: &Path) -> io::Result<()> {
        let stream = self
            .start(format!("scp -f '{}'", escape_for_shell(remote)))
            .await?;
        receive_file(stream, local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_header() {
        assert_eq!(parse_file_header("C0644 1234 motd\n").unwrap(), 1234);
        assert!(parse_file_header("D0755 0 dir\n").is_err());
        assert!(parse_file_header("C0644 big motd\n").is_err());
    }

    /// Plays the remote `scp -t` side over an in-memory pipe
    #[tokio::test]
    async fn test_send_file_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("hello.txt");
        std::fs::write(&local, b"hello\n").unwrap();

        let (client, server) = tokio::io::duplex(1024);
        let remote = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server.get_mut().write_all(&[0]).await.unwrap();

            let mut header = String::new();
            server.read_line(&mut header).await.unwrap();
            server.get_mut().write_all(&[0]).await.unwrap();

            let size = parse_file_header(&header).unwrap();
            let mut body = vec![0u8; size as usize + 1];
            server.read_exact(&mut body).await.unwrap();
            server.get_mut().write_all(&[0]).await.unwrap();
            (header, body)
        });

        send_file(client, &local, "/tmp/greeting.txt").await.unwrap();
        let (header, body) = remote.await.unwrap();
        assert!(header.starts_with('C'));
        assert!(header.ends_with(" 6 greeting.txt\n"));
        assert_eq!(body, b"hello\n\0".to_vec());
    }

    /// Plays the remote `scp -f` side over an in-memory pipe
    #[tokio::test]
    async fn test_receive_file_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("fetched");

        let (client, server) = tokio::io::duplex(1024);
        let remote = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut ack = [0u8; 1];
            server.read_exact(&mut ack).await.unwrap();
            server
                .get_mut()
                .write_all(b"C0600 5 data\n")
                .await
                .unwrap();
            server.read_exact(&mut ack).await.unwrap();
            server.get_mut().write_all(b"12345\0").await.unwrap();
            server.read_exact(&mut ack).await.unwrap();
        });

        receive_file(client, &local).await.unwrap();
        remote.await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"12345".to_vec());
    }

    #[tokio::test]
    async fn test_receive_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let remote = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut ack = [0u8; 1];
            server.read_exact(&mut ack).await.unwrap();
            server
                .get_mut()
                .write_all(b"\x01scp: /nope: No such file or directory\n")
                .await
                .unwrap();
        });

        let err = receive_file(client, &dir.path().join("x")).await.unwrap_err();
        remote.await.unwrap();
        assert_eq!(err.to_string(), "scp: /nope: No such file or directory");
    }
}
