//! Command execution over SSH
//!
//! Provides [`ExecutionResult`] and [`SshConnection::exec_command`], which runs a
//! command on a fresh channel and, when an escalation method expects a prompt,
//! negotiates that prompt before collecting the exit status.

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info};

use super::backend::ExecChannel;
use super::connection::SshConnection;
use super::elevation::Escalation;
use crate::error::{Result, TransportError};

/// Read size for escalation polling
pub const EXEC_BUFSIZE: usize = 4096;

const UNKNOWN_USER_MARKER: &[u8] = b"unknown user";

/// Outcome of a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Exit status; -1 when the channel closed without reporting one
    pub return_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    pub fn new(return_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            return_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// State of the escalation negotiation after one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    /// Neither marker seen yet
    Waiting,
    Success,
    PasswordPrompt,
    /// Remote side closed before either marker
    Closed,
}

/// Split into lines keeping their terminators (`\n`, `\r\n`, `\r`).
/// A trailing partial line is returned as is.
pub fn split_lines_inclusive(buf: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < buf.len() {
        match buf[i] {
            b'\n' => {
                lines.push(&buf[start..=i]);
                start = i + 1;
            }
            b'\r' => {
                let end = if buf.get(i + 1) == Some(&b'\n') { i + 1 } else { i };
                lines.push(&buf[start..=end]);
                i = end;
                start = end + 1;
            }
            _ => {}
        }
        i += 1;
    }

    if start < buf.len() {
        lines.push(&buf[start..]);
    }
    lines
}

/// Check every line of the accumulated output; the first success or prompt wins.
///
/// Every line is checked because sudo may lecture first and a chunk may end in
/// the middle of a line.
pub fn scan_become_output(escalation: &dyn Escalation, output: &[u8]) -> PromptState {
    for line in split_lines_inclusive(output) {
        if escalation.check_success(line) {
            return PromptState::Success;
        }
        if escalation.check_password_prompt(line) {
            return PromptState::PasswordPrompt;
        }
    }
    PromptState::Waiting
}

impl SshConnection {
    /// Run a command on the remote host.
    ///
    /// `in_data` is rejected: this transport does not pipe input into commands.
    /// With `sudoable` set and `pty` enabled a pseudo-terminal is requested, and
    /// a configured escalation that expects a prompt is negotiated first.
    pub async fn exec_command(
        &self,
        command: &str,
        in_data: Option<&[u8]>,
        sudoable: bool,
    ) -> Result<ExecutionResult> {
        if in_data.is_some_and(|d| !d.is_empty()) {
            return Err(TransportError::UnsupportedFeature(
                "this transport does not support input redirection on command execution"
                    .to_string(),
            ));
        }

        let session = self.ensure_connected().await?;
        let mut channel = session.new_channel().await.map_err(|e| {
            let text = match e {
                TransportError::Connection(msg) => msg,
                other => other.to_string(),
            };
            if text.is_empty() {
                TransportError::connection("Failed to open session")
            } else {
                TransportError::connection(format!("Failed to open session: {}", text))
            }
        })?;

        // sudo usually insists on a tty (requiretty)
        let result = if self.options().pty && sudoable {
            channel.request_pty().await
        } else {
            Ok(())
        };

        let result = match result {
            Ok(()) => {
                info!(host = %self.options().remote_addr, "EXEC {}", command);
                match self.escalation.clone() {
                    Some(escalation) if escalation.expects_prompt() => {
                        self.negotiate_escalation(channel.as_mut(), escalation.as_ref(), command)
                            .await
                    }
                    _ => channel.exec(command).await,
                }
            }
            Err(e) => Err(e),
        };

        // Only the last channel is kept; an earlier one is closed here
        let previous = self.channel.lock().await.replace(channel);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.close().await {
                debug!("Failed to close previous channel: {}", e);
            }
        }

        let result = result?;
        debug!(
            "Command completed: rc={}, stdout_len={}, stderr_len={}",
            result.return_code,
            result.stdout.len(),
            result.stderr.len()
        );
        Ok(result)
    }

    async fn negotiate_escalation(
        &self,
        channel: &mut dyn ExecChannel,
        escalation: &dyn Escalation,
        command: &str,
    ) -> Result<ExecutionResult> {
        channel.start(command.as_bytes()).await?;

        let mut become_output = Vec::new();
        let state = loop {
            debug!("Waiting for privilege escalation input");
            let chunk = match timeout(self.options().timeout, channel.recv(EXEC_BUFSIZE)).await {
                Ok(chunk) => chunk?,
                Err(_) => {
                    return Err(TransportError::Timeout {
                        output: String::from_utf8_lossy(&become_output).into_owned(),
                    })
                }
            };
            debug!("chunk is: {}", String::from_utf8_lossy(&chunk));

            let state = if chunk.is_empty() {
                PromptState::Closed
            } else {
                become_output.extend_from_slice(&chunk);
                scan_become_output(escalation, &become_output)
            };

            match state {
                PromptState::Waiting => continue,
                PromptState::Closed => {
                    if contains(&become_output, UNKNOWN_USER_MARKER) {
                        return Err(TransportError::escalation(format!(
                            "user {} does not exist",
                            escalation.escalation_user()
                        )));
                    }
                    break state;
                }
                other => break other,
            }
        };

        let mut result = ExecutionResult::default();
        if state == PromptState::PasswordPrompt {
            let mut secret = escalation.secret().ok_or_else(|| {
                TransportError::escalation("A password is required but none was supplied")
            })?;
            secret.push(b'\n');
            channel.send(&secret).await?;
        } else {
            result.stdout = become_output.clone();
            result.stderr = become_output.clone();
        }

        let exit = match timeout(self.options().timeout, channel.finish()).await {
            Ok(exit) => exit?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    output: String::from_utf8_lossy(&become_output).into_owned(),
                })
            }
        };
        result.stdout.extend_from_slice(&exit.stdout);
        result.stderr.extend_from_slice(&exit.stderr);
        result.return_code = exit.return_code();
        Ok(result)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
