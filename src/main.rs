//! SSH Transport - Entry point
//!
//! Parses CLI arguments, runs one exec / put / fetch against the remote host,
//! closes the connection and exits with the remote command's return code.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ssh_transport::config::{Args, Config, Task};
use ssh_transport::ssh::{SshConnection, SudoEscalation};

/// Exit code used when the run is interrupted
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Serialize)]
struct Report<'a> {
    host: &'a str,
    operation: &'static str,
    rc: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

fn init_tracing(verbose: u8) {
    let mut default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
    .to_string();
    // The SSH library stays quiet unless explicitly asked for
    if verbose > 3 {
        default_filter.push_str(",russh=debug");
    } else {
        default_filter.push_str(",russh=warn");
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(
    config: &Config,
    conn: &SshConnection,
    sudo: Option<&SudoEscalation>,
) -> anyhow::Result<i32> {
    let host = config.options.remote_addr.as_str();

    match &config.task {
        Task::Exec { command } => {
            // The same escalation instance recognises the prompt it put in the command
            let (command, sudoable) = match sudo {
                Some(sudo) => (sudo.build_command(command), true),
                None => (command.clone(), false),
            };

            let result = conn
                .exec_command(&command, None, sudoable)
                .await
                .with_context(|| format!("failed to run command on {}", host))?;

            if config.json {
                print_report(&Report {
                    host,
                    operation: "exec",
                    rc: result.return_code,
                    stdout: Some(result.stdout_lossy()),
                    stderr: Some(result.stderr_lossy()),
                })?;
            } else {
                std::io::stdout().write_all(&result.stdout)?;
                std::io::stderr().write_all(&result.stderr)?;
            }
            Ok(result.return_code)
        }
        Task::Put {
            local,
            remote,
            protocol,
        } => {
            conn.put_file(local, remote, *protocol)
                .await
                .with_context(|| format!("put {} to {}:{}", local.display(), host, remote))?;
            if config.json {
                print_report(&Report {
                    host,
                    operation: "put",
                    rc: 0,
                    stdout: None,
                    stderr: None,
                })?;
            }
            Ok(0)
        }
        Task::Fetch {
            remote,
            local,
            protocol,
        } => {
            conn.fetch_file(remote, local, *protocol)
                .await
                .with_context(|| format!("fetch {}:{} to {}", host, remote, local.display()))?;
            if config.json {
                print_report(&Report {
                    host,
                    operation: "fetch",
                    rc: 0,
                    stdout: None,
                    stderr: None,
                })?;
            }
            Ok(0)
        }
    }
}

fn print_report(report: &Report<'_>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();
    init_tracing(args.verbose);

    // Validate and create config
    let config = Config::from_args(args)?;

    info!("SSH Transport v{} starting...", env!("CARGO_PKG_VERSION"));

    let sudo = config.become_.as_ref().map(|become_| {
        info!("Escalating to '{}' with sudo", become_.user);
        Arc::new(SudoEscalation::new(&become_.user, become_.password.clone()))
    });

    let mut conn = SshConnection::new(config.options.clone());
    if let Some(sudo) = &sudo {
        conn = conn.with_escalation(sudo.clone());
    }

    let outcome = tokio::select! {
        result = run(&config, &conn, sudo.as_deref()) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
            None
        }
    };

    if let Err(e) = conn.close().await {
        warn!("Failed to close connection: {}", e);
    }

    let code = exit_code(outcome)?;
    std::process::exit(code);
}

/// Exit code for a finished or interrupted run. Errors are passed through
/// unlogged; returning them from `main` prints them once.
fn exit_code(outcome: Option<anyhow::Result<i32>>) -> anyhow::Result<i32> {
    match outcome {
        Some(result) => result,
        None => Ok(INTERRUPTED_EXIT_CODE),
    }
}
