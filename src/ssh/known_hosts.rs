//! Known hosts store
//!
//! Reads an OpenSSH `known_hosts` file and appends newly trusted keys to it.
//! Hashed host entries (`|1|...`) are skipped.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::config::DEFAULT_PORT;
use crate::error::Result;

/// Result of looking a host key up in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Same key type and key data are recorded for the host
    Verified,
    /// No key of this type is recorded for the host
    Unknown,
    /// A different key of the same type is recorded (possible MITM)
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file plus the entries added since loading
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    hosts: HashMap<String, Vec<HostKeyEntry>>,
    pending: Vec<String>,
}

impl KnownHosts {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
    }

    /// Load the file at `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            hosts: HashMap::new(),
            pending: Vec::new(),
        };

        if !store.path.exists() {
            debug!("Known hosts file {} does not exist yet", store.path.display());
            return Ok(store);
        }

        let content = fs::read_to_string(&store.path)?;
        let mut entry_count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || parts[0].starts_with('@') {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };
            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue;
                }
                store
                    .hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries from {}",
            entry_count,
            store.path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host pattern as OpenSSH writes it: bare host on port 22, `[host]:port` otherwise
    pub fn host_pattern(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == DEFAULT_PORT {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Check a host key given as key type and base64 blob
    pub fn check(&self, host: &str, port: u16, key_type: &str, key_data: &str) -> HostKeyStatus {
        let pattern = Self::host_pattern(host, port);
        let Some(entries) = self.hosts.get(&pattern) else {
            return HostKeyStatus::Unknown;
        };

        let mut status = HostKeyStatus::Unknown;
        for entry in entries.iter().filter(|e| e.key_type == key_type) {
            if entry.key_data == key_data {
                return HostKeyStatus::Verified;
            }
            status = HostKeyStatus::Changed;
        }

        if status == HostKeyStatus::Changed {
            warn!("HOST KEY CHANGED for {} (type: {})", pattern, key_type);
        }
        status
    }

    /// Record a key in memory; it is written out by [`KnownHosts::save`]
    pub fn add(&mut self, host: &str, port: u16, key_type: &str, key_data: &str) {
        if self.check(host, port, key_type, key_data) == HostKeyStatus::Verified {
            return;
        }

        let pattern = Self::host_pattern(host, port);
        self.pending
            .push(format!("{} {} {}", pattern, key_type, key_data));
        self.hosts.entry(pattern).or_default().push(HostKeyEntry {
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
        });
    }

    /// Append the keys added since loading, creating `~/.ssh` if needed
    pub fn save(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in self.pending.drain(..) {
            writeln!(file, "{}", line)?;
        }

        info!("Updated known hosts file {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_pattern() {
        assert_eq!(KnownHosts::host_pattern("Web01", 22), "web01");
        assert_eq!(KnownHosts::host_pattern("web01", 2222), "[web01]:2222");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
        assert_eq!(
            store.check("web01", 22, "ssh-ed25519", "AAAA"),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_verify_and_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "# comment\n\
             web01,10.0.0.1 ssh-ed25519 AAAAkey1 root@web01\n\
             [db]:2222 ssh-rsa AAAAkey2\n\
             |1|hashed|salt ssh-ed25519 AAAAkey3\n",
        )
        .unwrap();

        let store = KnownHosts::load(&path).unwrap();
        assert_eq!(
            store.check("web01", 22, "ssh-ed25519", "AAAAkey1"),
            HostKeyStatus::Verified
        );
        assert_eq!(
            store.check("10.0.0.1", 22, "ssh-ed25519", "AAAAkey1"),
            HostKeyStatus::Verified
        );
        assert_eq!(
            store.check("web01", 22, "ssh-ed25519", "AAAAother"),
            HostKeyStatus::Changed
        );
        assert_eq!(
            store.check("web01", 22, "ecdsa-sha2-nistp256", "AAAAkey1"),
            HostKeyStatus::Unknown
        );
        assert_eq!(
            store.check("db", 2222, "ssh-rsa", "AAAAkey2"),
            HostKeyStatus::Verified
        );
        assert_eq!(
            store.check("db", 22, "ssh-rsa", "AAAAkey2"),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_add_then_save_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");

        let mut store = KnownHosts::load(&path).unwrap();
        store.add("web01", 2222, "ssh-ed25519", "AAAAnew");
        store.add("web01", 2222, "ssh-ed25519", "AAAAnew");
        assert_eq!(
            store.check("web01", 2222, "ssh-ed25519", "AAAAnew"),
            HostKeyStatus::Verified
        );
        assert!(!path.exists());

        store.save().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[web01]:2222 ssh-ed25519 AAAAnew\n");

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(
            reloaded.check("web01", 2222, "ssh-ed25519", "AAAAnew"),
            HostKeyStatus::Verified
        );
    }
}
