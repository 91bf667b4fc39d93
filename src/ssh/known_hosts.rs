//! Known-hosts trust store
//!
//! Standard OpenSSH `known_hosts` lines (`<pattern> <key-type> <base64>`),
//! merged from the usual candidate locations. The store only ever appends;
//! existing lines are never rewritten or reordered.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::credentials::expand_tilde;
use super::error::SshError;

/// One parsed known-hosts line, per hostname when the line carries a
/// comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostsRecord {
    /// `host` or `[host]:port`, lowercased
    pub pattern: String,
    /// e.g. `ssh-ed25519`
    pub key_type: String,
    /// Standard base64 of the wire-format public key
    pub key_base64: String,
}

/// Merged view over every known-hosts file that exists, plus the primary
/// path new entries are appended to.
pub struct KnownHostsStore {
    records: Vec<KnownHostsRecord>,
    primary_path: PathBuf,
}

impl KnownHostsStore {
    /// Load from the default candidate locations, or from `override_path`
    /// in place of the per-user file.
    pub fn load(override_path: Option<&Path>) -> Self {
        Self::from_paths(&Self::candidate_paths(override_path))
    }

    /// Load from an explicit path list. The first path is the primary one
    /// even if it does not exist yet.
    pub fn from_paths(paths: &[PathBuf]) -> Self {
        let primary_path = paths
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));

        let mut records = Vec::new();
        for path in paths {
            parse_file(path, &mut records);
        }
        debug!(
            "Loaded {} known host records from {} candidate file(s)",
            records.len(),
            paths.len()
        );

        Self {
            records,
            primary_path,
        }
    }

    /// Candidate file paths in search order: the per-user file (or its
    /// override), then the system-wide files. Duplicates collapse to their
    /// first occurrence.
    pub fn candidate_paths(override_path: Option<&Path>) -> Vec<PathBuf> {
        let user_path = match override_path {
            Some(p) => expand_tilde(p),
            None => dirs::home_dir()
                .map(|h| h.join(".ssh").join("known_hosts"))
                .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts")),
        };

        let mut paths = Vec::new();
        for p in [
            user_path,
            PathBuf::from("/etc/ssh/ssh_known_hosts"),
            PathBuf::from("/etc/ssh/ssh_known_hosts2"),
        ] {
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
        paths
    }

    /// All records whose pattern equals `pattern` (case-insensitive).
    pub fn lookup(&self, pattern: &str) -> Vec<&KnownHostsRecord> {
        let pattern = pattern.to_lowercase();
        self.records
            .iter()
            .filter(|r| r.pattern == pattern)
            .collect()
    }

    /// Where trust-on-first-use entries are persisted.
    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    /// Append one entry to the primary file, creating parent directories as
    /// needed. Never truncates.
    pub fn append(&self, pattern: &str, key_type: &str, key_base64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.primary_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.primary_path)?;
        writeln!(file, "{} {} {}", pattern, key_type, key_base64)?;

        Ok(())
    }
}

/// Pattern a host is stored under: bare hostname on the default port,
/// `[host]:port` otherwise.
pub fn make_pattern(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA-256 fingerprint of a public key, in the OpenSSH presentation
/// (`SHA256:` + unpadded base64).
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Base64 of the wire-format key blob, as stored in known-hosts lines.
pub fn key_base64(key: &PublicKey) -> String {
    BASE64.encode(key.public_key_bytes())
}

fn parse_file(path: &Path, records: &mut Vec<KnownHostsRecord>) {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("Skipping known_hosts candidate {}: {}", path.display(), e);
            return;
        }
    };

    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                debug!("Stopped reading {}: {}", path.display(), e);
                return;
            }
        };
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // hostname[,alias...] keytype base64key [comment]
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        let key_type = parts[1];
        let key_base64 = parts[2];

        for hostname in parts[0].split(',') {
            // Hashed hostnames (|1|...) cannot be matched by pattern
            if hostname.starts_with('|') {
                continue;
            }
            records.push(KnownHostsRecord {
                pattern: hostname.to_lowercase(),
                key_type: key_type.to_string(),
                key_base64: key_base64.to_string(),
            });
        }
    }
}
