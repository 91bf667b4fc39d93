//! SSH connection configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Connection parameters for one SSH session.
///
/// The whole struct moves into the worker when the backend starts; nothing
/// mutates it afterwards except the password, which is taken and wiped at
/// the moment it is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Pre-configured password. When absent the operator is prompted on the
    /// console once the public-key candidates are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Explicit private key file to try first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Pinned host key fingerprint (`SHA256:...`). Checked before any
    /// known-hosts lookup; a mismatch is fatal under every policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_fingerprint: Option<String>,

    /// How unknown and changed host keys are handled
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Known-hosts file overriding `~/.ssh/known_hosts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<PathBuf>,

    /// Bound on TCP connect and on the SSH handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            key_file: None,
            expected_fingerprint: None,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_file: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Host key trust policy.
///
/// - `Strict`: unknown hosts are rejected outright.
/// - `AcceptNew`: unknown hosts go through the trust-on-first-use prompt.
/// - `Off`: every key is accepted and the trust store is never touched.
///
/// Changed keys are rejected under `Strict` and `AcceptNew` alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    Strict,
    #[default]
    AcceptNew,
    Off,
}

impl HostKeyPolicy {
    /// Parse a policy string. Unrecognized values normalize to `AcceptNew`,
    /// the safe interactive default.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => HostKeyPolicy::Strict,
            "off" => HostKeyPolicy::Off,
            _ => HostKeyPolicy::AcceptNew,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse_normalizes() {
        assert_eq!(HostKeyPolicy::parse("strict"), HostKeyPolicy::Strict);
        assert_eq!(HostKeyPolicy::parse("STRICT"), HostKeyPolicy::Strict);
        assert_eq!(HostKeyPolicy::parse("off"), HostKeyPolicy::Off);
        assert_eq!(HostKeyPolicy::parse("accept-new"), HostKeyPolicy::AcceptNew);
        assert_eq!(HostKeyPolicy::parse("ask"), HostKeyPolicy::AcceptNew);
        assert_eq!(HostKeyPolicy::parse(""), HostKeyPolicy::AcceptNew);
    }

    #[test]
    fn defaults() {
        let config = SshConfig::new("tty.example", "operator");
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(config.password.is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SshConfig =
            serde_json::from_str(r#"{"host": "tty.example", "username": "operator"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
    }
}
