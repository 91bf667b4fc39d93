//! SSH error types
//!
//! Every fatal condition the worker can hit maps to one variant here, and
//! every variant belongs to exactly one surfacing class (see
//! [`SshError::class`]). The worker converts the error to a single console
//! line at one place; nothing else prints errors.

use thiserror::Error;

/// How an error is presented on the teletype console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Host identity problems. Prefixed with `SECURITY ERROR:`.
    Security,
    /// Resolution and TCP-level failures. The message is already a full
    /// sentence aimed at the operator.
    Network,
    /// Protocol and authentication failures. Prefixed with `SSH error:`.
    Ssh,
    /// Shutdown requested while waiting. Never printed.
    Shutdown,
    /// Anything else. Prefixed with `Unexpected error:`.
    Unexpected,
}

#[derive(Error, Debug)]
pub enum SshError {
    /// Presented key does not match the explicitly pinned fingerprint.
    #[error("Host key verification failed!\r\nExpected: {expected}\r\nReceived: {received}")]
    FingerprintMismatch { expected: String, received: String },

    /// Host is in the trust store but none of its recorded keys match.
    #[error("REMOTE HOST IDENTIFICATION HAS CHANGED for {0}")]
    HostKeyChanged(String),

    /// Host absent from the trust store under strict policy.
    #[error("Unknown host {0} (not in known_hosts; strict mode)")]
    UnknownHost(String),

    /// Operator declined the key at the trust-on-first-use prompt.
    #[error("User rejected unknown host key")]
    HostKeyRejected,

    #[error("Network error: Unable to resolve or reach {0}. Is the device offline?")]
    Resolve(String),

    #[error("Connection to {host}:{port} timed out.")]
    ConnectTimeout { host: String, port: u16 },

    #[error("Connection refused by {host}:{port}. Is SSH running?")]
    ConnectionRefused { host: String, port: u16 },

    /// Every credential candidate and interactive method was exhausted.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// `close()` was requested while the worker was blocked waiting.
    #[error("shutdown requested")]
    Shutdown,

    /// Transport or protocol failure reported by the SSH stack. Carries
    /// the library message; the surfacing prefix is added once by the
    /// worker.
    #[error("{0}")]
    Protocol(String),

    #[error("agent: {0}")]
    Agent(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SshError::FingerprintMismatch { .. }
            | SshError::HostKeyChanged(_)
            | SshError::UnknownHost(_)
            | SshError::HostKeyRejected => ErrorClass::Security,
            SshError::Resolve(_)
            | SshError::ConnectTimeout { .. }
            | SshError::ConnectionRefused { .. } => ErrorClass::Network,
            SshError::AuthenticationFailed | SshError::Protocol(_) | SshError::Agent(_) => {
                ErrorClass::Ssh
            }
            SshError::Shutdown => ErrorClass::Shutdown,
            SshError::Io(_) => ErrorClass::Unexpected,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, SshError::Shutdown)
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}
