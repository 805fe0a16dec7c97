//! Configuration and CLI argument parsing for SSH Transport
//!
//! CLI flags (with `SSH_TRANSPORT_*` environment fallbacks) are layered over an
//! optional JSON options file and resolved through the same
//! [`OptionLookup`](crate::ssh::OptionLookup) contract a library caller uses.

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::ssh::elevation::sanitize_password;
use crate::ssh::{ConnectionOptions, TransferProtocol};

/// Default user for `--become`
pub const DEFAULT_BECOME_USER: &str = "root";

/// SSH Transport CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "ssh-transport")]
#[command(version)]
#[command(about = "Run commands and copy files on remote hosts over SSH")]
pub struct Args {
    /// Remote host to connect to
    #[arg(long, env = "SSH_TRANSPORT_HOST")]
    pub host: Option<String>,

    /// SSH port [default: 22]
    #[arg(long, env = "SSH_TRANSPORT_PORT")]
    pub port: Option<u16>,

    /// Remote user (defaults to the local user)
    #[arg(long, env = "SSH_TRANSPORT_USER")]
    pub user: Option<String>,

    /// Login password, also used as the private key passphrase
    #[arg(long, env = "SSH_TRANSPORT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Keyboard-interactive prompt that should receive the password
    #[arg(long, env = "SSH_TRANSPORT_PASSWORD_PROMPT")]
    pub password_prompt: Option<String>,

    /// Path to SSH private key file
    #[arg(long, env = "SSH_TRANSPORT_KEY")]
    pub key: Option<PathBuf>,

    /// Proxy command; %h, %p and %r are replaced
    #[arg(long, env = "SSH_TRANSPORT_PROXY_COMMAND")]
    pub proxy_command: Option<String>,

    /// Extra ssh arguments scanned for ProxyCommand (deprecated)
    #[arg(long, env = "SSH_TRANSPORT_SSH_COMMON_ARGS", allow_hyphen_values = true)]
    pub ssh_common_args: Option<String>,

    /// Extra ssh arguments scanned for ProxyCommand (deprecated)
    #[arg(long, env = "SSH_TRANSPORT_SSH_EXTRA_ARGS", allow_hyphen_values = true)]
    pub ssh_extra_args: Option<String>,

    /// Accept any host key without checking
    #[arg(long, env = "SSH_TRANSPORT_NO_HOST_KEY_CHECKING")]
    pub no_host_key_checking: bool,

    /// Accept unknown host keys without asking
    #[arg(long, env = "SSH_TRANSPORT_HOST_KEY_AUTO_ADD")]
    pub host_key_auto_add: bool,

    /// Do not try keys from ~/.ssh
    #[arg(long, env = "SSH_TRANSPORT_NO_LOOK_FOR_KEYS")]
    pub no_look_for_keys: bool,

    /// Never request a pseudo-terminal
    #[arg(long, env = "SSH_TRANSPORT_NO_PTY")]
    pub no_pty: bool,

    /// Treat the connection as persistent (no interactive host key prompts)
    #[arg(long, env = "SSH_TRANSPORT_PERSISTENT")]
    pub persistent: bool,

    /// Connect and escalation timeout in seconds [default: 10]
    #[arg(long, env = "SSH_TRANSPORT_TIMEOUT")]
    pub timeout: Option<f64>,

    /// Alternate OpenSSH client config file
    #[arg(long, env = "SSH_TRANSPORT_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Preferred host key algorithms, comma separated
    #[arg(long, env = "SSH_TRANSPORT_HOSTKEYS")]
    pub hostkeys: Option<String>,

    /// Accepted public key algorithms, comma separated
    #[arg(long, env = "SSH_TRANSPORT_PUBLICKEY_ALGORITHMS")]
    pub publickey_algorithms: Option<String>,

    /// Known hosts file [default: ~/.ssh/known_hosts]
    #[arg(long, env = "SSH_TRANSPORT_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// JSON object of connection options; flags override its values
    #[arg(long, env = "SSH_TRANSPORT_OPTIONS_FILE")]
    pub options_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, ...). Above 3 the SSH library logs too.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run the command through sudo
    #[arg(long = "become")]
    pub become_: bool,

    /// User to become
    #[arg(long, default_value = DEFAULT_BECOME_USER, env = "SSH_TRANSPORT_BECOME_USER")]
    pub become_user: String,

    /// sudo password
    #[arg(long, env = "SSH_TRANSPORT_BECOME_PASSWORD", hide_env_values = true)]
    pub become_password: Option<String>,

    /// Print a JSON report instead of raw output
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub operation: Operation,
}

/// What to do once connected
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Execute a command on the remote host
    Exec {
        /// Command line, passed to the remote shell as is
        command: String,
    },
    /// Copy a local file to the remote host
    Put {
        local: PathBuf,
        remote: String,
        /// Transfer protocol: sftp or scp
        #[arg(long, default_value = "sftp")]
        proto: String,
    },
    /// Copy a remote file to the local host
    Fetch {
        remote: String,
        local: PathBuf,
        /// Transfer protocol: sftp or scp
        #[arg(long, default_value = "sftp")]
        proto: String,
    },
}

/// Validated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Exec {
        command: String,
    },
    Put {
        local: PathBuf,
        remote: String,
        protocol: TransferProtocol,
    },
    Fetch {
        remote: String,
        local: PathBuf,
        protocol: TransferProtocol,
    },
}

/// `--become` settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BecomeConfig {
    pub user: String,
    pub password: Option<String>,
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved connection options
    pub options: ConnectionOptions,

    /// Operation to run
    pub task: Task,

    /// Privilege escalation, if requested
    pub become_: Option<BecomeConfig>,

    /// Print a JSON report
    pub json: bool,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        let mut lookup = match &args.options_file {
            Some(path) => read_options_file(path)?,
            None => Map::new(),
        };
        apply_cli_overrides(&mut lookup, &args);

        validate_args(&args, &lookup)?;

        let options = ConnectionOptions::from_lookup(&lookup)?;
        let task = parse_operation(args.operation)?;

        let become_ = args.become_.then(|| BecomeConfig {
            user: args.become_user,
            password: sanitize_password(args.become_password.as_deref()),
        });

        Ok(Config {
            options,
            task,
            become_,
            json: args.json,
        })
    }
}

/// Load a JSON object of option names to values
fn read_options_file(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TransportError::config(format!(
            "cannot read options file {}: {}",
            path.display(),
            e
        ))
    })?;

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TransportError::config(format!(
            "options file {} must contain a JSON object",
            path.display()
        ))),
        Err(e) => Err(TransportError::config(format!(
            "invalid options file {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Flags given on the command line replace options file values
fn apply_cli_overrides(lookup: &mut Map<String, Value>, args: &Args) {
    let mut set = |name: &str, value: Value| {
        lookup.insert(name.to_string(), value);
    };
    let path = |p: &PathBuf| Value::String(p.display().to_string());

    if let Some(host) = &args.host {
        set("remote_addr", Value::String(host.clone()));
    }
    if let Some(port) = args.port {
        set("port", Value::from(port));
    }
    if let Some(user) = &args.user {
        set("remote_user", Value::String(user.clone()));
    }
    if let Some(password) = sanitize_password(args.password.as_deref()) {
        set("password", Value::String(password));
    }
    if let Some(prompt) = &args.password_prompt {
        set("password_prompt", Value::String(prompt.clone()));
    }
    if let Some(key) = &args.key {
        set("private_key_file", path(key));
    }
    if let Some(cmd) = &args.proxy_command {
        set("proxy_command", Value::String(cmd.clone()));
    }
    if let Some(v) = &args.ssh_common_args {
        set("ssh_common_args", Value::String(v.clone()));
    }
    if let Some(v) = &args.ssh_extra_args {
        set("ssh_extra_args", Value::String(v.clone()));
    }
    if args.no_host_key_checking {
        set("host_key_checking", Value::Bool(false));
    }
    if args.host_key_auto_add {
        set("host_key_auto_add", Value::Bool(true));
    }
    if args.no_look_for_keys {
        set("look_for_keys", Value::Bool(false));
    }
    if args.no_pty {
        set("pty", Value::Bool(false));
    }
    if args.persistent {
        set("use_persistent_connections", Value::Bool(true));
    }
    if let Some(timeout) = args.timeout {
        set("timeout", Value::from(timeout));
    }
    if let Some(file) = &args.config_file {
        set("config_file", path(file));
    }
    if let Some(v) = &args.hostkeys {
        set("hostkeys", Value::String(v.clone()));
    }
    if let Some(v) = &args.publickey_algorithms {
        set("publickey_accepted_algorithms", Value::String(v.clone()));
    }
    if let Some(file) = &args.known_hosts {
        set("known_hosts_file", path(file));
    }
    if args.verbose > 0 {
        set("verbosity", Value::from(args.verbose));
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args, lookup: &Map<String, Value>) -> Result<()> {
    let mut errors = Vec::new();

    if !lookup
        .get("remote_addr")
        .and_then(Value::as_str)
        .is_some_and(|h| !h.is_empty())
    {
        errors.push("Missing required --host".to_string());
    }

    // If key is provided, check if file exists
    if let Some(key_path) = lookup.get("private_key_file").and_then(Value::as_str) {
        if !Path::new(key_path).exists() && !key_path.starts_with('~') {
            errors.push(format!("SSH key file not found: {}", key_path));
        }
    }

    if let Some(timeout) = args.timeout {
        if !(timeout.is_finite() && timeout > 0.0) {
            errors.push(format!("--timeout must be a positive number, got {}", timeout));
        }
    }

    if args.become_password.is_some() && !args.become_ {
        errors.push("--become-password requires --become".to_string());
    }

    if !errors.is_empty() {
        return Err(TransportError::Config(errors.join("\n")));
    }

    Ok(())
}

fn parse_operation(operation: Operation) -> Result<Task> {
    Ok(match operation {
        Operation::Exec { command } => Task::Exec { command },
        Operation::Put {
            local,
            remote,
            proto,
        } => Task::Put {
            local,
            remote,
            protocol: TransferProtocol::from_str(&proto)?,
        },
        Operation::Fetch {
            remote,
            local,
            proto,
        } => Task::Fetch {
            remote,
            local,
            protocol: TransferProtocol::from_str(&proto)?,
        },
    })
}
