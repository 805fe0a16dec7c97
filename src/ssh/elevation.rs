//! Privilege escalation
//!
//! The executor only needs the [`Escalation`] capability: does the command expect
//! an interactive prompt, which output lines mean success or a password prompt,
//! and what secret to answer with. [`SudoEscalation`] is the stock implementation.

use uuid::Uuid;

/// Capability contract of a privilege-escalation method
pub trait Escalation: Send + Sync {
    /// Whether the wrapped command negotiates over the channel before running
    fn expects_prompt(&self) -> bool;

    /// `line` (with its terminator) shows that escalation succeeded
    fn check_success(&self, line: &[u8]) -> bool;

    /// `line` (with its terminator) is the password prompt
    fn check_password_prompt(&self, line: &[u8]) -> bool;

    /// Password to send to the prompt
    fn secret(&self) -> Option<Vec<u8>>;

    /// User being escalated to
    fn escalation_user(&self) -> &str;
}

/// `sudo` with a unique prompt and success marker per instance
#[derive(Clone)]
pub struct SudoEscalation {
    user: String,
    password: Option<String>,
    prompt: String,
    success: String,
}

impl SudoEscalation {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            user: user.into(),
            password: sanitize_password(password.as_deref()),
            prompt: format!("[sudo via ssh-transport, key={}] password:", nonce),
            success: format!("BECOME-SUCCESS-{}", nonce),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn success_marker(&self) -> &str {
        &self.success
    }

    /// Wrap `command` so it runs as the target user and echoes the success marker
    /// first.
    ///
    /// Without a password, `sudo -n` fails instead of prompting.
    pub fn build_command(&self, command: &str) -> String {
        let inner = format!(
            "echo {}; {}",
            self.success,
            command
        );
        let escaped = escape_for_shell(&inner);

        if self.password.is_some() {
            format!(
                "sudo -H -S -p \"{}\" -u {} /bin/sh -c '{}'",
                self.prompt, self.user, escaped
            )
        } else {
            format!("sudo -H -S -n -u {} /bin/sh -c '{}'", self.user, escaped)
        }
    }
}

impl Escalation for SudoEscalation {
    fn expects_prompt(&self) -> bool {
        self.password.is_some()
    }

    fn check_success(&self, line: &[u8]) -> bool {
        trim_line(line) == self.success.as_bytes()
    }

    fn check_password_prompt(&self, line: &[u8]) -> bool {
        let line = trim_line(line);
        let prompt = self.prompt.as_bytes();
        line.len() >= prompt.len() && &line[line.len() - prompt.len()..] == prompt
    }

    fn secret(&self) -> Option<Vec<u8>> {
        self.password.as_ref().map(|p| p.as_bytes().to_vec())
    }

    fn escalation_user(&self) -> &str {
        &self.user
    }
}

impl std::fmt::Debug for SudoEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoEscalation")
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &line[..end]
}

/// Escapes a string for safe use in single-quoted shell contexts.
///
/// ```
/// use ssh_transport::ssh::elevation::escape_for_shell;
///
/// assert_eq!(escape_for_shell("hello"), "hello");
/// assert_eq!(escape_for_shell("it's"), "it'\"'\"'s");
/// ```
pub fn escape_for_shell(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Trims a password; empty or whitespace-only passwords become `None`.
pub fn sanitize_password(password: Option<&str>) -> Option<String> {
    password
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_with_password() {
        let sudo = SudoEscalation::new("root", Some("secret".to_string()));
        let cmd = sudo.build_command("id -u");

        assert!(cmd.starts_with(&format!("sudo -H -S -p \"{}\" -u root /bin/sh -c '", sudo.prompt())));
        assert!(cmd.ends_with(&format!("echo {}; id -u'", sudo.success_marker())));
        assert!(sudo.expects_prompt());
    }

    #[test]
    fn test_build_command_without_password() {
        let sudo = SudoEscalation::new("postgres", None);
        let cmd = sudo.build_command("echo 'hi'");

        assert!(cmd.starts_with("sudo -H -S -n -u postgres /bin/sh -c '"));
        assert!(cmd.contains("echo '\"'\"'hi'\"'\"''"));
        assert!(!sudo.expects_prompt());
        assert!(sudo.secret().is_none());
    }

    #[test]
    fn test_markers_are_unique() {
        let a = SudoEscalation::new("root", None);
        let b = SudoEscalation::new("root", None);
        assert_ne!(a.success_marker(), b.success_marker());
        assert!(a.success_marker().starts_with("BECOME-SUCCESS-"));
    }

    #[test]
    fn test_line_checks() {
        let sudo = SudoEscalation::new("root", Some(" pw ".to_string()));
        let success = format!("{}\r\n", sudo.success_marker());
        let prompt = format!("{} ", sudo.prompt());

        assert!(sudo.check_success(success.as_bytes()));
        assert!(!sudo.check_success(b"We trust you have received the usual lecture\n"));
        assert!(sudo.check_password_prompt(prompt.as_bytes()));
        assert!(!sudo.check_password_prompt(b"Password:"));
        assert_eq!(sudo.secret(), Some(b"pw".to_vec()));
        assert_eq!(sudo.escalation_user(), "root");
    }

    #[test]
    fn test_escape_for_shell_multiple_quotes() {
        assert_eq!(
            escape_for_shell("'a' and 'b'"),
            "'\"'\"'a'\"'\"' and '\"'\"'b'\"'\"'"
        );
    }

    #[test]
    fn test_sanitize_password() {
        assert_eq!(
            sanitize_password(Some("  secret  ")),
            Some("secret".to_string())
        );
        assert_eq!(sanitize_password(Some("   ")), None);
        assert_eq!(sanitize_password(None), None);
    }
}
