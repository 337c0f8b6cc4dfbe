//! Known hosts file for host key verification
//!
//! Reads and appends OpenSSH `known_hosts` lines. Hashed hostnames
//! (`|1|...`) are ignored; entries for non-default ports use the
//! `[host]:port` form.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of checking a server key against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Verified,
    /// No key of this type recorded for the host
    Unknown,
    Changed { expected_fingerprint: String },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn open_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"));
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hosts = match Self::load(&path) {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Failed to load known_hosts {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            hosts: RwLock::new(hosts),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<HashMap<String, Vec<HostKeyEntry>>, SshError> {
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
        if !path.exists() {
            return Ok(hosts);
        }

        let reader = BufReader::new(fs::File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostnames keytype base64 [comment]
            let mut parts = line.split_whitespace();
            let (Some(names), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            for name in names.split(',').filter(|n| !n.starts_with('|')) {
                hosts
                    .entry(name.to_lowercase())
                    .or_default()
                    .push(HostKeyEntry {
                        key_type: key_type.to_string(),
                        key_data: key_data.to_string(),
                    });
            }
        }

        debug!("Loaded {} known hosts from {}", hosts.len(), path.display());
        Ok(hosts)
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// `SHA256:<base64>` without padding, as printed by `ssh-keygen -l`
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let lookup = Self::make_key(host, port);
        let key_type = key.algorithm().as_str().to_string();
        let key_b64 = BASE64.encode(key.public_key_bytes());

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup) else {
            return HostKeyStatus::Unknown;
        };

        let mut same_type = entries.iter().filter(|e| e.key_type == key_type).peekable();
        if same_type.peek().is_none() {
            return HostKeyStatus::Unknown;
        }

        let mut expected = None;
        for entry in same_type {
            if entry.key_data == key_b64 {
                return HostKeyStatus::Verified;
            }
            expected.get_or_insert_with(|| {
                BASE64
                    .decode(&entry.key_data)
                    .map(|b| Self::fingerprint_bytes(&b))
                    .unwrap_or_else(|_| "unknown".to_string())
            });
        }

        HostKeyStatus::Changed {
            expected_fingerprint: expected.unwrap_or_default(),
        }
    }

    /// Record a key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup = Self::make_key(host, port);
        let entry = HostKeyEntry {
            key_type: key.algorithm().as_str().to_string(),
            key_data: BASE64.encode(key.public_key_bytes()),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup, entry.key_type, entry.key_data)?;

        info!("Added {} host key for {} to known_hosts", entry.key_type, lookup);
        self.hosts.write().entry(lookup).or_default().push(entry);
        Ok(())
    }
}
