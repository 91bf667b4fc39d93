//! Host identity verification
//!
//! Runs inside the SSH handshake: russh hands the server's key to
//! [`TrustHandler::check_server_key`], which walks the trust decision in
//! strict order. Explicit fingerprint pin first (a mismatch is fatal under
//! every policy), then the policy gate, then the known-hosts lookup with a
//! trust-on-first-use prompt for hosts never seen before. Authentication
//! cannot begin until this returns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::backend::{ConnectionState, StateCell};
use super::config::{HostKeyPolicy, SshConfig};
use super::error::SshError;
use super::interactive::InteractiveBridge;
use super::known_hosts::{self, KnownHostsStore};
use crate::output::OutputSink;

pub struct HostVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    expected_fingerprint: Option<String>,
    known_hosts_file: Option<PathBuf>,
    bridge: Arc<InteractiveBridge>,
    output: Arc<dyn OutputSink>,
}

impl HostVerifier {
    pub fn new(
        config: &SshConfig,
        bridge: Arc<InteractiveBridge>,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            policy: config.host_key_policy,
            expected_fingerprint: config.expected_fingerprint.clone(),
            known_hosts_file: config.known_hosts_file.clone(),
            bridge,
            output,
        }
    }

    /// Decide whether the presented server key is trusted.
    pub async fn verify(&self, server_key: &PublicKey) -> Result<(), SshError> {
        let fingerprint = known_hosts::fingerprint(server_key);

        if let Some(expected) = &self.expected_fingerprint {
            if expected != &fingerprint {
                warn!(
                    "Pinned fingerprint mismatch for {}: expected {}, received {}",
                    self.host, expected, fingerprint
                );
                return Err(SshError::FingerprintMismatch {
                    expected: expected.clone(),
                    received: fingerprint,
                });
            }
            debug!("Pinned fingerprint matched for {}", self.host);
        }

        if self.policy == HostKeyPolicy::Off {
            debug!("Host key checking is off, accepting key for {}", self.host);
            return Ok(());
        }

        let store = KnownHostsStore::load(self.known_hosts_file.as_deref());
        let presented_type = server_key.algorithm().to_string();
        let presented_b64 = known_hosts::key_base64(server_key);
        let patterns = [
            self.host.clone(),
            format!("[{}]:{}", self.host, self.port),
        ];

        let mut pattern_found = false;
        for pattern in &patterns {
            let records = store.lookup(pattern);
            if records.is_empty() {
                continue;
            }
            pattern_found = true;
            if records
                .iter()
                .any(|r| r.key_type == presented_type && r.key_base64 == presented_b64)
            {
                info!("Host key verified for {} (pattern {})", self.host, pattern);
                return Ok(());
            }
        }

        if pattern_found {
            // Known host presenting a key we have never recorded, under any
            // key type. Possible man-in-the-middle.
            warn!(
                "Host key for {} matches no stored record (presented {}, {})",
                self.host, presented_type, fingerprint
            );
            return Err(SshError::HostKeyChanged(self.host.clone()));
        }

        if self.policy == HostKeyPolicy::Strict {
            warn!("Unknown host {} rejected under strict policy", self.host);
            return Err(SshError::UnknownHost(self.host.clone()));
        }

        self.prompt_trust_on_first_use(server_key, &fingerprint, &store)
            .await
    }

    /// Ask the operator about a never-seen host key. `yes` persists the key,
    /// `once` trusts it for this session, anything else rejects.
    async fn prompt_trust_on_first_use(
        &self,
        server_key: &PublicKey,
        fingerprint: &str,
        store: &KnownHostsStore,
    ) -> Result<(), SshError> {
        let warning = format!(
            "The authenticity of host '{}' cannot be established.\r\n\
             Key type: {}\r\n\
             Fingerprint: {}\r\n\
             Are you sure you want to continue connecting (yes/no/once)? ",
            self.host,
            server_key.algorithm(),
            fingerprint
        );
        self.output.receive_data(warning.as_bytes());

        let reply = self.bridge.read_line().await?;
        self.output.receive_data(b"\r\n");

        match reply.trim().to_lowercase().as_str() {
            "yes" => {
                let pattern = known_hosts::make_pattern(&self.host, self.port);
                let key_type = server_key.algorithm().to_string();
                let key_base64 = known_hosts::key_base64(server_key);
                match store.append(&pattern, &key_type, &key_base64) {
                    Ok(()) => {
                        info!(
                            "Added {} to {}",
                            pattern,
                            store.primary_path().display()
                        );
                        self.output.receive_data(
                            format!(
                                "Warning: Permanently added '{}' to known_hosts.\r\n",
                                self.host
                            )
                            .as_bytes(),
                        );
                    }
                    Err(e) => {
                        // A read-only known_hosts must not block the session
                        warn!("Could not persist host key: {}", e);
                        self.output
                            .receive_data(b"Warning: Could not write to known_hosts.\r\n");
                    }
                }
                Ok(())
            }
            "once" => {
                debug!("Host key for {} trusted for this session only", self.host);
                Ok(())
            }
            _ => Err(SshError::HostKeyRejected),
        }
    }
}

/// russh client handler wiring the verifier into the handshake.
///
/// `verifying` is raised for exactly the span of the verification call;
/// the connection worker stops its handshake timeout while it is up, so
/// a slow answer at the trust prompt never counts against the budget.
pub(crate) struct TrustHandler {
    verifier: HostVerifier,
    state: Arc<StateCell>,
    verifying: Arc<AtomicBool>,
}

impl TrustHandler {
    pub(crate) fn new(
        verifier: HostVerifier,
        state: Arc<StateCell>,
        verifying: Arc<AtomicBool>,
    ) -> Self {
        Self {
            verifier,
            state,
            verifying,
        }
    }
}

impl client::Handler for TrustHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.state.set(ConnectionState::VerifyingHost);
        self.verifying.store(true, Ordering::SeqCst);
        let decision = self.verifier.verify(server_public_key).await;
        self.verifying.store(false, Ordering::SeqCst);
        decision?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BufferSink;
    use russh::client::Handler;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const OTHER_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf";

    fn key(line: &str) -> PublicKey {
        PublicKey::from_openssh(line).unwrap()
    }

    fn blob(line: &str) -> &str {
        line.split_whitespace().nth(1).unwrap()
    }

    struct Fixture {
        sink: Arc<BufferSink>,
        bridge: Arc<InteractiveBridge>,
        verifier: HostVerifier,
    }

    fn fixture(policy: HostKeyPolicy, pin: Option<String>, known_hosts: &Path) -> Fixture {
        let sink = Arc::new(BufferSink::new());
        let running = Arc::new(AtomicBool::new(true));
        let bridge = Arc::new(InteractiveBridge::new(sink.clone(), running));

        let config = SshConfig {
            host: "tty.example".into(),
            username: "operator".into(),
            expected_fingerprint: pin,
            host_key_policy: policy,
            known_hosts_file: Some(known_hosts.to_path_buf()),
            ..SshConfig::default()
        };
        let verifier = HostVerifier::new(&config, bridge.clone(), sink.clone());

        Fixture {
            sink,
            bridge,
            verifier,
        }
    }

    #[tokio::test]
    async fn known_key_accepted_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!(
                "tty.example ssh-rsa AAAAsomeotherrecord\ntty.example ssh-ed25519 {}\n",
                blob(HOST_KEY)
            ),
        )
        .unwrap();

        let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn changed_key_rejected_under_both_policies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!("tty.example ssh-ed25519 {}\n", blob(OTHER_KEY)),
        )
        .unwrap();

        for policy in [HostKeyPolicy::AcceptNew, HostKeyPolicy::Strict] {
            let f = fixture(policy, None, &path);
            let err = f.verifier.verify(&key(HOST_KEY)).await.unwrap_err();
            assert!(matches!(err, SshError::HostKeyChanged(ref h) if h == "tty.example"));
            // no prompt on a changed key
            assert!(f.sink.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_host_rejected_in_strict_mode() {
        let dir = tempdir().unwrap();
        let f = fixture(HostKeyPolicy::Strict, None, &dir.path().join("absent"));
        let err = f.verifier.verify(&key(HOST_KEY)).await.unwrap_err();
        assert!(matches!(err, SshError::UnknownHost(_)));
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn tofu_yes_persists_the_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
        f.bridge.feed(b"yes\r");
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();

        let saved = fs::read_to_string(&path).unwrap();
        assert_eq!(
            saved,
            format!("tty.example ssh-ed25519 {}\n", blob(HOST_KEY))
        );

        let text = f.sink.text();
        assert!(text.contains("The authenticity of host 'tty.example'"));
        assert!(text.contains("Are you sure you want to continue connecting (yes/no/once)? "));
        assert!(text.contains("Warning: Permanently added 'tty.example' to known_hosts.\r\n"));
    }

    #[tokio::test]
    async fn tofu_reply_is_trimmed_and_case_insensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
        f.bridge.feed(b"  YES  \r");
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn tofu_once_trusts_without_persisting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
        f.bridge.feed(b"once\r");
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn tofu_other_replies_reject() {
        for reply in [&b"no\r"[..], b"maybe\r", b"\r"] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("known_hosts");

            let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
            f.bridge.feed(reply);
            let err = f.verifier.verify(&key(HOST_KEY)).await.unwrap_err();
            assert!(matches!(err, SshError::HostKeyRejected));
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn tofu_write_failure_still_connects() {
        let dir = tempdir().unwrap();
        // parent of the primary path is a file, so the append must fail
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("known_hosts");

        let f = fixture(HostKeyPolicy::AcceptNew, None, &path);
        f.bridge.feed(b"yes\r");
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();
        assert!(f
            .sink
            .text()
            .contains("Warning: Could not write to known_hosts.\r\n"));
    }

    #[tokio::test]
    async fn pin_mismatch_is_fatal_even_with_policy_off() {
        let dir = tempdir().unwrap();
        let pin = known_hosts::fingerprint(&key(OTHER_KEY));

        let f = fixture(
            HostKeyPolicy::Off,
            Some(pin.clone()),
            &dir.path().join("absent"),
        );
        let err = f.verifier.verify(&key(HOST_KEY)).await.unwrap_err();
        match err {
            SshError::FingerprintMismatch { expected, received } => {
                assert_eq!(expected, pin);
                assert_eq!(received, known_hosts::fingerprint(&key(HOST_KEY)));
            }
            other => panic!("expected fingerprint mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pin_match_does_not_skip_store_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!("tty.example ssh-ed25519 {}\n", blob(OTHER_KEY)),
        )
        .unwrap();

        let pin = known_hosts::fingerprint(&key(HOST_KEY));
        let f = fixture(HostKeyPolicy::AcceptNew, Some(pin), &path);
        let err = f.verifier.verify(&key(HOST_KEY)).await.unwrap_err();
        assert!(matches!(err, SshError::HostKeyChanged(_)));
    }

    #[tokio::test]
    async fn policy_off_never_reads_the_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        // a record that would fail the lookup as a changed key
        fs::write(
            &path,
            format!("tty.example ssh-ed25519 {}\n", blob(OTHER_KEY)),
        )
        .unwrap();

        let f = fixture(HostKeyPolicy::Off, None, &path);
        f.verifier.verify(&key(HOST_KEY)).await.unwrap();
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn verifying_flag_is_down_after_the_key_is_accepted() {
        let dir = tempdir().unwrap();
        let f = fixture(HostKeyPolicy::AcceptNew, None, &dir.path().join("known_hosts"));
        f.bridge.feed(b"once\r");

        let state = Arc::new(StateCell::new());
        let verifying = Arc::new(AtomicBool::new(false));
        let mut handler = TrustHandler::new(f.verifier, state.clone(), verifying.clone());

        assert!(handler.check_server_key(&key(HOST_KEY)).await.unwrap());
        assert!(!verifying.load(Ordering::SeqCst));
        assert_eq!(state.get(), ConnectionState::VerifyingHost);
    }

    #[tokio::test]
    async fn verifying_flag_is_down_after_the_key_is_rejected() {
        let dir = tempdir().unwrap();
        let f = fixture(HostKeyPolicy::Strict, None, &dir.path().join("absent"));

        let state = Arc::new(StateCell::new());
        let verifying = Arc::new(AtomicBool::new(false));
        let mut handler = TrustHandler::new(f.verifier, state, verifying.clone());

        let err = handler.check_server_key(&key(HOST_KEY)).await.unwrap_err();
        assert!(matches!(err, SshError::UnknownHost(_)));
        assert!(!verifying.load(Ordering::SeqCst));
    }
}
