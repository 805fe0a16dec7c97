//! Minimal OpenSSH client config reader
//!
//! Only the directives that change where and how we connect are read:
//! `HostName`, `Port`, `User`, `IdentityFile` and `ProxyCommand`. As in OpenSSH
//! the first value found for a directive wins across all matching `Host` blocks.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Settings resolved for one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSettings {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_files: Vec<PathBuf>,
    pub proxy_command: Option<String>,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    directives: Vec<(String, String)>,
}

/// Parsed config file
#[derive(Debug, Clone, Default)]
pub struct SshConfigFile {
    blocks: Vec<HostBlock>,
}

impl SshConfigFile {
    /// Read and parse `path`; a missing file parses as empty
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("SSH config {} not found", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Self {
        // Directives before the first Host line apply to every host
        let mut blocks = vec![HostBlock {
            patterns: vec!["*".to_string()],
            directives: Vec::new(),
        }];

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = split_directive(line) else {
                continue;
            };

            if key.eq_ignore_ascii_case("host") {
                blocks.push(HostBlock {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    directives: Vec::new(),
                });
            } else if let Some(block) = blocks.last_mut() {
                block.directives.push((key.to_lowercase(), value.to_string()));
            }
        }

        Self { blocks }
    }

    /// Collect the settings that apply to `host`
    pub fn resolve(&self, host: &str) -> HostSettings {
        let mut settings = HostSettings::default();

        for block in self.blocks.iter().filter(|b| host_matches(&b.patterns, host)) {
            for (key, value) in &block.directives {
                match key.as_str() {
                    "hostname" if settings.hostname.is_none() => {
                        settings.hostname = Some(value.replace("%h", host));
                    }
                    "port" if settings.port.is_none() => settings.port = value.parse().ok(),
                    "user" if settings.user.is_none() => settings.user = Some(value.clone()),
                    "identityfile" => settings.identity_files.push(expand_tilde(value)),
                    "proxycommand" if settings.proxy_command.is_none() => {
                        if !value.eq_ignore_ascii_case("none") {
                            settings.proxy_command = Some(value.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        settings
    }
}

/// `Key Value` or `Key=Value`; surrounding quotes on the value are dropped
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..split_at];
    let value = line[split_at..]
        .trim_start_matches(|c: char| c.is_whitespace())
        .trim_start_matches('=')
        .trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    if key.is_empty() || value.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

fn expand_tilde(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

/// A block applies when some pattern matches and no negated pattern does
fn host_matches(patterns: &[String], host: &str) -> bool {
    let host = host.to_lowercase();
    let mut matched = false;

    for pattern in patterns {
        let pattern = pattern.to_lowercase();
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated.as_bytes(), host.as_bytes()) {
                return false;
            }
        } else if glob_match(pattern.as_bytes(), host.as_bytes()) {
            matched = true;
        }
    }

    matched
}

/// `*` and `?` wildcards
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
