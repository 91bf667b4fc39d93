//! SSH backend - host trust, authentication and the interactive shell relay
//!
//! Everything a terminal device needs to reach a remote shell over SSH,
//! built on the russh client stack.
//!
//! # Features
//! - Host key verification: fingerprint pinning, known_hosts lookup and
//!   trust-on-first-use prompting (strict / accept-new / off policies)
//! - Authentication cascade: configured key, agent keys, default key files,
//!   password prompt, keyboard-interactive (OTP/2FA)
//! - Line-oriented prompting over the terminal itself, with masked entry
//!   for secrets
//! - Byte relay between the device and the remote PTY

mod agent;
mod backend;
mod config;
mod credentials;
mod error;
mod interactive;
pub mod known_hosts;
mod verify;

pub use agent::{is_agent_available, SshAgentClient};
pub use backend::{ConnectionState, SshBackend};
pub use config::{HostKeyPolicy, SshConfig};
pub use credentials::{
    default_key_paths, CredentialCandidate, CredentialProvider, EnumeratedCredentials,
};
pub use error::{ErrorClass, SshError};
pub use known_hosts::KnownHostsStore;
