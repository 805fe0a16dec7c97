//! Connection options
//!
//! The transport never resolves configuration itself. It receives final values
//! through [`OptionLookup`] and turns them into a typed [`ConnectionOptions`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Result, TransportError};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default connect / escalation poll timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Lookup contract for already-resolved option values
pub trait OptionLookup {
    /// Return the resolved value for `name`, or `None` if unset
    fn get_option(&self, name: &str) -> Option<Value>;
}

impl OptionLookup for HashMap<String, Value> {
    fn get_option(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl OptionLookup for serde_json::Map<String, Value> {
    fn get_option(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Typed, resolved options for one SSH connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Remote hostname or IP address
    pub remote_addr: String,

    /// User to log in as (falls back to the local user)
    pub remote_user: Option<String>,

    /// SSH port (default: 22)
    pub port: Option<u16>,

    /// Login password, also used as private key passphrase
    pub password: Option<String>,

    /// Keyboard-interactive prompt text that identifies the password prompt
    pub password_prompt: Option<String>,

    /// Path to a private key file
    pub private_key_file: Option<PathBuf>,

    /// Proxy command template (`%h`, `%p`, `%r`)
    pub proxy_command: Option<String>,

    /// Deprecated ssh CLI argument strings, scanned for ProxyCommand
    pub ssh_args: Option<String>,
    pub ssh_common_args: Option<String>,
    pub ssh_extra_args: Option<String>,

    pub host_key_checking: bool,
    pub host_key_auto_add: bool,
    pub look_for_keys: bool,

    /// Request a pseudo-terminal for sudoable commands
    pub pty: bool,

    /// Comma separated list of accepted public key algorithms
    pub publickey_accepted_algorithms: Option<String>,

    /// Comma separated list of preferred server host key types
    pub hostkeys: Option<String>,

    /// Alternate OpenSSH client config file
    pub config_file: Option<PathBuf>,

    /// Known hosts file (default: ~/.ssh/known_hosts)
    pub known_hosts_file: Option<PathBuf>,

    pub use_persistent_connections: bool,

    /// Connect timeout, also bounds each escalation poll
    pub timeout: Duration,

    /// Verbosity as given by the caller; above 3 the SSH library logs too
    pub verbosity: u8,
}

impl ConnectionOptions {
    /// Create options with defaults for everything but the address
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_user: None,
            port: None,
            password: None,
            password_prompt: None,
            private_key_file: None,
            proxy_command: None,
            ssh_args: None,
            ssh_common_args: None,
            ssh_extra_args: None,
            host_key_checking: true,
            host_key_auto_add: false,
            look_for_keys: true,
            pty: true,
            publickey_accepted_algorithms: None,
            hostkeys: None,
            config_file: None,
            known_hosts_file: None,
            use_persistent_connections: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            verbosity: 0,
        }
    }

    /// Resolve options through an [`OptionLookup`]
    pub fn from_lookup(lookup: &dyn OptionLookup) -> Result<Self> {
        let remote_addr = get_string(lookup, "remote_addr")?
            .ok_or_else(|| TransportError::config("remote_addr is required"))?;

        let mut options = Self::new(remote_addr);
        options.remote_user = get_string(lookup, "remote_user")?;
        options.port = match get_u64(lookup, "port")? {
            Some(port) => Some(
                u16::try_from(port)
                    .map_err(|_| TransportError::config(format!("invalid port {}", port)))?,
            ),
            None => None,
        };
        options.password = get_string(lookup, "password")?;
        options.password_prompt = get_string(lookup, "password_prompt")?;
        options.private_key_file = get_string(lookup, "private_key_file")?.map(PathBuf::from);
        options.proxy_command = get_string(lookup, "proxy_command")?;
        options.ssh_args = get_string(lookup, "ssh_args")?;
        options.ssh_common_args = get_string(lookup, "ssh_common_args")?;
        options.ssh_extra_args = get_string(lookup, "ssh_extra_args")?;
        options.publickey_accepted_algorithms =
            get_string(lookup, "publickey_accepted_algorithms")?;
        options.hostkeys = get_string(lookup, "hostkeys")?;
        options.config_file = get_string(lookup, "config_file")?.map(PathBuf::from);
        options.known_hosts_file = get_string(lookup, "known_hosts_file")?.map(PathBuf::from);

        if let Some(v) = get_bool(lookup, "host_key_checking")? {
            options.host_key_checking = v;
        }
        if let Some(v) = get_bool(lookup, "host_key_auto_add")? {
            options.host_key_auto_add = v;
        }
        if let Some(v) = get_bool(lookup, "look_for_keys")? {
            options.look_for_keys = v;
        }
        if let Some(v) = get_bool(lookup, "pty")? {
            options.pty = v;
        }
        if let Some(v) = get_bool(lookup, "use_persistent_connections")? {
            options.use_persistent_connections = v;
        }
        if let Some(secs) = get_f64(lookup, "timeout")? {
            options.timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                TransportError::config(format!("invalid timeout {}: {}", secs, e))
            })?;
        }
        if let Some(v) = get_u64(lookup, "verbosity")? {
            options.verbosity = v.min(u8::MAX as u64) as u8;
        }

        Ok(options)
    }

    /// Set the remote user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set password authentication
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the private key file
    pub fn with_private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    /// Set the proxy command template
    pub fn with_proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }

    /// Set the connect / poll timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Effective remote user: configured, else the local login name
    pub fn resolved_user(&self) -> Result<String> {
        if let Some(user) = self.remote_user.as_deref().filter(|u| !u.is_empty()) {
            return Ok(user.to_string());
        }
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .map_err(|_| TransportError::config("remote_user is not set and no local user found"))
    }
}

/// Accepts JSON strings only; empty strings count as unset
fn get_string(lookup: &dyn OptionLookup, name: &str) -> Result<Option<String>> {
    match lookup.get_option(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(TransportError::config(format!(
            "option {} expects a string, got {}",
            name, other
        ))),
    }
}

fn get_bool(lookup: &dyn OptionLookup, name: &str) -> Result<Option<bool>> {
    match lookup.get_option(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "y" | "t" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "n" | "f" | "" => Ok(Some(false)),
            _ => Err(TransportError::config(format!(
                "option {} expects a boolean, got '{}'",
                name, s
            ))),
        },
        Some(other) => Err(TransportError::config(format!(
            "option {} expects a boolean, got {}",
            name, other
        ))),
    }
}

fn get_u64(lookup: &dyn OptionLookup, name: &str) -> Result<Option<u64>> {
    match lookup.get_option(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| TransportError::config(format!("option {} must be a positive integer", name))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
            TransportError::config(format!("option {} must be a positive integer, got '{}'", name, s))
        }),
        Some(other) => Err(TransportError::config(format!(
            "option {} expects an integer, got {}",
            name, other
        ))),
    }
}

fn get_f64(lookup: &dyn OptionLookup, name: &str) -> Result<Option<f64>> {
    match lookup.get_option(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
            TransportError::config(format!("option {} must be a number, got '{}'", name, s))
        }),
        Some(other) => Err(TransportError::config(format!(
            "option {} expects a number, got {}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::from_lookup(&lookup(json!({"remote_addr": "web01"}))).unwrap();

        assert_eq!(options.remote_addr, "web01");
        assert_eq!(options.port(), 22);
        assert!(options.host_key_checking);
        assert!(!options.host_key_auto_add);
        assert!(options.look_for_keys);
        assert!(options.pty);
        assert!(!options.use_persistent_connections);
        assert_eq!(options.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(options.proxy_command.is_none());
    }

    #[test]
    fn test_missing_address() {
        let err = ConnectionOptions::from_lookup(&lookup(json!({"port": 22}))).unwrap_err();
        assert!(err.to_string().contains("remote_addr"));
    }

    #[test]
    fn test_string_booleans_and_numbers() {
        let options = ConnectionOptions::from_lookup(&lookup(json!({
            "remote_addr": "10.0.0.5",
            "remote_user": "deploy",
            "port": "2222",
            "host_key_checking": "False",
            "host_key_auto_add": "yes",
            "pty": 0,
            "timeout": 2.5,
            "ssh_common_args": "",
        })))
        .unwrap();

        assert_eq!(options.port(), 2222);
        assert_eq!(options.remote_user.as_deref(), Some("deploy"));
        assert!(!options.host_key_checking);
        assert!(options.host_key_auto_add);
        assert!(!options.pty);
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert!(options.ssh_common_args.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let err = ConnectionOptions::from_lookup(&lookup(json!({
            "remote_addr": "h",
            "pty": "maybe",
        })))
        .unwrap_err();
        assert!(err.to_string().contains("pty"));

        let err = ConnectionOptions::from_lookup(&lookup(json!({
            "remote_addr": "h",
            "port": 70000,
        })))
        .unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn test_out_of_range_timeout() {
        for secs in [json!(1e30), json!(-1.0)] {
            let err = ConnectionOptions::from_lookup(&lookup(json!({
                "remote_addr": "h",
                "timeout": secs,
            })))
            .unwrap_err();
            assert!(err.to_string().contains("invalid timeout"), "{}", err);
        }
    }

    #[test]
    fn test_builder() {
        let options = ConnectionOptions::new("192.168.1.1")
            .with_user("admin")
            .with_port(2222)
            .with_password("secret");

        assert_eq!(options.remote_addr, "192.168.1.1");
        assert_eq!(options.port(), 2222);
        assert_eq!(options.resolved_user().unwrap(), "admin");
        assert_eq!(options.password, Some("secret".to_string()));
        assert!(options.private_key_file.is_none());
    }
}
