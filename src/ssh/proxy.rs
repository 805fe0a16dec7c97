//! Proxy command resolution
//!
//! The effective proxy command comes either from the deprecated ssh CLI argument
//! strings (`ssh_extra_args`, `ssh_common_args`, `ssh_args`) or from the
//! `proxy_command` option, and has its `%h`, `%p` and `%r` placeholders filled in.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::config::ConnectionOptions;

/// `key=value` or `key value` inside a single lexed token
static SETTINGS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)(?:\s*=\s*|\s+)(.+)").expect("settings regex is valid")
});

const DEPRECATION_WARNING: &str = "The ssh_*_args options are deprecated and will be removed in a release after 2026-01-01. Please use the proxy_command option instead.";

/// Resolve the proxy command for a connection to `host:port` as `user`.
///
/// Returns `None` when neither the legacy arguments nor `proxy_command` name one.
pub fn resolve_proxy_command(
    options: &ConnectionOptions,
    host: &str,
    port: u16,
    user: &str,
) -> Option<String> {
    let legacy = [
        options.ssh_extra_args.as_deref().unwrap_or(""),
        options.ssh_common_args.as_deref().unwrap_or(""),
        options.ssh_args.as_deref().unwrap_or(""),
    ];
    let has_legacy = legacy.iter().any(|s| !s.is_empty());

    let from_legacy = if has_legacy {
        find_proxy_command(&legacy.join(" "))
    } else {
        None
    };

    let proxy_command = from_legacy
        .or_else(|| options.proxy_command.clone())
        .filter(|c| !c.is_empty())?;

    if has_legacy {
        warn!("{}", DEPRECATION_WARNING);
    }

    let resolved = substitute_placeholders(&proxy_command, host, port, user);
    debug!("Resolved proxy command: {}", resolved);
    Some(resolved)
}

/// Scan shell-lexed ssh arguments for a ProxyCommand setting. First match wins.
///
/// An unquoted value keeps going through the following tokens up to the next
/// option flag, so `-o ProxyCommand=nc %h %p` yields `nc %h %p`.
fn find_proxy_command(args: &str) -> Option<String> {
    let Some(tokens) = shlex::split(args) else {
        warn!("Could not parse ssh arguments (unbalanced quotes): {}", args);
        return None;
    };

    for (i, token) in tokens.iter().enumerate() {
        let (value, rest_from) = if token.eq_ignore_ascii_case("proxycommand") {
            // The lexer split the keyword from its value
            match tokens.get(i + 1) {
                Some(value) => (value.clone(), i + 2),
                None => continue,
            }
        } else {
            match SETTINGS_REGEX.captures(token) {
                Some(caps) if caps[1].eq_ignore_ascii_case("proxycommand") => {
                    (caps[2].to_string(), i + 1)
                }
                _ => continue,
            }
        };

        let mut parts = vec![value];
        parts.extend(
            tokens[rest_from.min(tokens.len())..]
                .iter()
                .take_while(|t| !t.starts_with('-'))
                .cloned(),
        );
        let command = parts.join(" ");
        if !command.trim().is_empty() {
            return Some(command);
        }
    }

    None
}

/// Replace `%h`, `%p`, `%r` in a single left-to-right pass so substituted text is
/// never rescanned.
pub fn substitute_placeholders(template: &str, host: &str, port: u16, user: &str) -> String {
    let mut out = String::with_capacity(template.len() + host.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('h') => {
                    out.push_str(host);
                    chars.next();
                    continue;
                }
                Some('p') => {
                    out.push_str(&port.to_string());
                    chars.next();
                    continue;
                }
                Some('r') => {
                    out.push_str(user);
                    chars.next();
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }

    out
}
