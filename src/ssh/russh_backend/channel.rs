//! Command channel over russh

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::debug;

use crate::error::Result;
use crate::ssh::backend::{ChannelExit, ExecChannel};
use crate::ssh::command::ExecutionResult;

pub struct RusshChannel {
    channel: Channel<Msg>,
    /// Output read from the wire but not yet handed out by `recv`
    pending: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
    closed: bool,
}

impl RusshChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel,
            pending: Vec::new(),
            exit_status: None,
            eof: false,
            closed: false,
        }
    }

    /// Wait for the next message; `false` once the channel is gone
    async fn pump(&mut self, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> bool {
        match self.channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
                true
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                // ext == 1 is stderr
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                } else {
                    stdout.extend_from_slice(&data);
                }
                true
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
                true
            }
            Some(ChannelMsg::Eof) => {
                self.eof = true;
                true
            }
            Some(ChannelMsg::Close) | None => {
                self.eof = true;
                self.closed = true;
                false
            }
            Some(_) => true,
        }
    }

    async fn drain(&mut self) -> ChannelExit {
        let mut stdout = std::mem::take(&mut self.pending);
        let mut stderr = Vec::new();
        while !self.closed && self.pump(&mut stdout, &mut stderr).await {}

        ChannelExit {
            exit_status: self.exit_status,
            stdout,
            stderr,
        }
    }
}

#[async_trait]
impl ExecChannel for RusshChannel {
    async fn request_pty(&mut self) -> Result<()> {
        self.channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await?;
        Ok(())
    }

    async fn start(&mut self, command: &[u8]) -> Result<()> {
        self.channel.exec(true, command.to_vec()).await?;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        // sudo writes its prompt to stderr when there is no tty, so both
        // streams feed the negotiation
        while self.pending.is_empty() && !self.eof {
            let mut out = Vec::new();
            let mut err = Vec::new();
            self.pump(&mut out, &mut err).await;
            self.pending.extend_from_slice(&out);
            self.pending.extend_from_slice(&err);
        }

        let take = self.pending.len().min(max);
        Ok(self.pending.drain(..take).collect())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecutionResult> {
        self.channel.exec(true, command).await?;
        let exit = self.drain().await;
        debug!(
            "Command completed: exit_status={:?}, stdout_len={}, stderr_len={}",
            exit.exit_status,
            exit.stdout.len(),
            exit.stderr.len()
        );

        Ok(ExecutionResult {
            return_code: exit.return_code(),
            stdout: exit.stdout,
            stderr: exit.stderr,
        })
    }

    async fn finish(&mut self) -> Result<ChannelExit> {
        Ok(self.drain().await)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.channel.close().await?;
        self.closed = true;
        Ok(())
    }
}
