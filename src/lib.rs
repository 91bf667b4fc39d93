//! OxideTTY - SSH trust and authentication for teletype-class terminals
//!
//! Connects current-loop era hardware to modern SSH infrastructure: host
//! key trust with OpenSSH-style known_hosts handling, the full client
//! authentication cascade, and a byte relay for the remote shell.

pub mod logging;
pub mod output;
pub mod ssh;
