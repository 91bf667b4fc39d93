//! Connection lifecycle: the worker thread that owns the transport, the
//! authentication cascade, the shell channel and the byte relay.
//!
//! [`SshBackend`] is the device-facing half. Its methods are synchronous
//! and non-blocking; everything network-shaped happens on a dedicated
//! worker thread running a single-threaded tokio runtime, and results come
//! back through the [`OutputSink`]. One backend is one connection attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::config::SshConfig;
use super::credentials::{CredentialCandidate, CredentialProvider};
use super::error::{ErrorClass, SshError};
use super::interactive::{InteractiveBridge, POLL_INTERVAL};
use super::verify::{HostVerifier, TrustHandler};
use crate::output::OutputSink;

const TTY_TERM: &str = "tty33";
const TTY_COLS: u32 = 72;
const TTY_ROWS: u32 = 24;

/// Depth of the keystroke queue feeding the shell channel.
const REMOTE_QUEUE_DEPTH: usize = 1024;

const DISCONNECT_NOTICE: &[u8] = b"Disconnected. Local mode.\r\n";

/// Upper bound on the best-effort goodbye packets during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a connection attempt currently stands. States advance strictly
/// forward within one attempt and end at `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    TransportOpen,
    VerifyingHost,
    Authenticating,
    ShellOpen,
    Closing,
}

/// Shared state slot, written by the worker and readable from the device
/// side at any time.
pub struct StateCell {
    inner: RwLock<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.inner.read()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let mut current = self.inner.write();
        debug!("connection state {:?} -> {:?}", *current, next);
        *current = next;
    }
}

/// SSH transport for a terminal device, driven over an [`OutputSink`].
///
/// ```no_run
/// use std::sync::Arc;
/// use oxidetty::output::BufferSink;
/// use oxidetty::ssh::{SshBackend, SshConfig};
///
/// let sink = Arc::new(BufferSink::new());
/// let mut backend = SshBackend::new(
///     SshConfig::new("bastion.example.com", "operator"),
///     sink.clone(),
/// );
/// backend.start();
/// backend.send_data(b"ls\r");
/// backend.close();
/// ```
pub struct SshBackend {
    config: Option<SshConfig>,
    info: String,
    output: Arc<dyn OutputSink>,
    bridge: Arc<InteractiveBridge>,
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
    remote_tx: Arc<RwLock<Option<mpsc::Sender<Bytes>>>>,
    worker: Option<JoinHandle<()>>,
}

impl SshBackend {
    pub fn new(config: SshConfig, output: Arc<dyn OutputSink>) -> Self {
        let info = format!(
            "SSH V2 - {}@{}: {}",
            config.username, config.host, config.port
        );
        let running = Arc::new(AtomicBool::new(false));
        let bridge = Arc::new(InteractiveBridge::new(output.clone(), running.clone()));
        Self {
            config: Some(config),
            info,
            output,
            bridge,
            running,
            state: Arc::new(StateCell::new()),
            remote_tx: Arc::new(RwLock::new(None)),
            worker: None,
        }
    }

    /// Launch the connection attempt. Returns immediately; all progress,
    /// prompts and errors arrive through the output sink.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            warn!("start() called on a backend that is already running");
            return;
        }
        let Some(config) = self.config.take() else {
            warn!("start() called on a backend that already ran");
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        let worker = Worker {
            conn_id: Uuid::new_v4(),
            config,
            output: self.output.clone(),
            bridge: self.bridge.clone(),
            running: self.running.clone(),
            state: self.state.clone(),
            remote_tx: self.remote_tx.clone(),
        };
        self.worker = Some(std::thread::spawn(move || worker.run()));
    }

    /// Bytes typed on the device. While the shell channel is up they are
    /// relayed to the remote side; before that they feed the local line
    /// editor behind the trust and credential prompts.
    pub fn send_data(&self, data: &[u8]) {
        let tx = self.remote_tx.read().clone();
        match tx {
            Some(tx) => {
                if tx.try_send(Bytes::copy_from_slice(data)).is_err() {
                    debug!("remote input queue unavailable, dropping {} bytes", data.len());
                }
            }
            None => self.bridge.feed(data),
        }
    }

    /// Stop the worker and wait for it to wind down. Safe to call more
    /// than once, and on a backend that never started.
    ///
    /// Returns within one polling interval plus teardown; every wait the
    /// worker can be blocked in re-checks the running flag on that cadence.
    pub fn close(&mut self) {
        // The worker clears the flag itself right before its final state
        // transition, so a true value here means it will still pass
        // through Disconnected after our Closing.
        if self.running.swap(false, Ordering::SeqCst) {
            self.state.set(ConnectionState::Closing);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("SSH worker thread panicked");
                self.state.set(ConnectionState::Disconnected);
            }
        }
    }

    /// Human-readable connection summary for status displays.
    pub fn info_string(&self) -> String {
        self.info.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for SshBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything the worker thread owns for the duration of one attempt.
struct Worker {
    conn_id: Uuid,
    config: SshConfig,
    output: Arc<dyn OutputSink>,
    bridge: Arc<InteractiveBridge>,
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
    remote_tx: Arc<RwLock<Option<mpsc::Sender<Bytes>>>>,
}

impl Worker {
    fn run(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("failed to build worker runtime: {}", e);
                self.output
                    .receive_data(format!("Unexpected error: {}\r\n", e).as_bytes());
                self.output.receive_data(DISCONNECT_NOTICE);
                self.running.store(false, Ordering::SeqCst);
                self.state.set(ConnectionState::Disconnected);
                return;
            }
        };
        runtime.block_on(self.run_async());
    }

    async fn run_async(mut self) {
        info!(
            "ssh worker {} connecting to {}:{} as {}",
            self.conn_id, self.config.host, self.config.port, self.config.username
        );
        let result = self.connect_and_serve().await;
        *self.remote_tx.write() = None;
        if let Err(err) = result {
            self.surface(&err);
        }
        self.output.receive_data(DISCONNECT_NOTICE);
        // Flag first: close() only interleaves a Closing while the flag is
        // still set, so Disconnected always lands last.
        self.running.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Disconnected);
        info!("ssh worker {} finished", self.conn_id);
    }

    /// One error reaches the operator per attempt, classified once here.
    fn surface(&self, err: &SshError) {
        match err.class() {
            ErrorClass::Shutdown => {
                debug!("ssh worker {} stopped by request", self.conn_id);
            }
            ErrorClass::Security => {
                warn!("ssh worker {} security failure: {}", self.conn_id, err);
                self.output
                    .receive_data(format!("SECURITY ERROR: {}\r\n", err).as_bytes());
            }
            ErrorClass::Network => {
                info!("ssh worker {} network failure: {}", self.conn_id, err);
                self.output.receive_data(format!("{}\r\n", err).as_bytes());
            }
            ErrorClass::Ssh => {
                info!("ssh worker {} ssh failure: {}", self.conn_id, err);
                self.output
                    .receive_data(format!("SSH error: {}\r\n", err).as_bytes());
            }
            ErrorClass::Unexpected => {
                warn!("ssh worker {} unexpected failure: {}", self.conn_id, err);
                self.output
                    .receive_data(format!("Unexpected error: {}\r\n", err).as_bytes());
            }
        }
    }

    /// Drive a fallible operation while honoring `close()`: every poll
    /// interval the running flag is re-checked, and shutdown wins over
    /// whatever the operation would have returned.
    async fn with_shutdown<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, SshError>
    where
        SshError: From<E>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                res = &mut fut => return Ok(res?),
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return Err(SshError::Shutdown);
                    }
                }
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Result<(), SshError> {
        let mut handle = self.establish().await?;
        let result = self.authenticate_and_relay(&mut handle).await;
        self.state.set(ConnectionState::Closing);
        let _ = timeout(
            TEARDOWN_TIMEOUT,
            handle.disconnect(Disconnect::ByApplication, "Session closed", "en"),
        )
        .await;
        result
    }

    /// Resolve, dial and run the SSH handshake. Host key verification
    /// happens inside the handshake via [`TrustHandler`].
    async fn establish(&mut self) -> Result<client::Handle<TrustHandler>, SshError> {
        let host = self.config.host.clone();
        let port = self.config.port;
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);

        self.state.set(ConnectionState::Resolving);
        let addr = format!("{}:{}", host, port);
        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|_| SshError::Resolve(host.clone()))?
            .next()
            .ok_or_else(|| SshError::Resolve(host.clone()))?;
        debug!("resolved {} to {}", addr, socket_addr);

        let stream = timeout(connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::ConnectTimeout {
                host: host.clone(),
                port,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => SshError::ConnectionRefused {
                    host: host.clone(),
                    port,
                },
                _ => SshError::Io(e),
            })?;
        self.state.set(ConnectionState::TransportOpen);
        debug!("tcp connected to {}", socket_addr);

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let verifier = HostVerifier::new(&self.config, self.bridge.clone(), self.output.clone());
        let verifying = Arc::new(AtomicBool::new(false));
        let handler = TrustHandler::new(verifier, self.state.clone(), verifying.clone());

        // The handshake budget must not count time spent in host
        // verification; the operator may take arbitrarily long at the
        // trust prompt. It resumes the moment the verifier returns.
        let mut budget = connect_timeout;
        let connect_fut = client::connect_stream(ssh_config, stream, handler);
        tokio::pin!(connect_fut);
        let handle = loop {
            tokio::select! {
                res = &mut connect_fut => break res?,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return Err(SshError::Shutdown);
                    }
                    if !verifying.load(Ordering::SeqCst) {
                        budget = budget.saturating_sub(POLL_INTERVAL);
                        if budget.is_zero() {
                            return Err(SshError::Protocol(
                                "SSH handshake timed out".to_string(),
                            ));
                        }
                    }
                }
            }
        };
        debug!("ssh handshake complete for {}", addr);
        Ok(handle)
    }

    async fn authenticate_and_relay(
        &mut self,
        handle: &mut client::Handle<TrustHandler>,
    ) -> Result<(), SshError> {
        self.state.set(ConnectionState::Authenticating);
        self.authenticate(handle).await?;

        let mut channel = self.with_shutdown(handle.channel_open_session()).await?;
        self.with_shutdown(channel.request_pty(false, TTY_TERM, TTY_COLS, TTY_ROWS, 0, 0, &[]))
            .await?;
        self.with_shutdown(channel.request_shell(false)).await?;
        info!("ssh worker {} shell open", self.conn_id);
        self.state.set(ConnectionState::ShellOpen);

        let (tx, mut rx) = mpsc::channel::<Bytes>(REMOTE_QUEUE_DEPTH);
        *self.remote_tx.write() = Some(tx);
        let result = self.relay(&mut channel, &mut rx).await;
        *self.remote_tx.write() = None;
        let _ = timeout(TEARDOWN_TIMEOUT, channel.eof()).await;
        result
    }

    /// Try every authentication method in order until one lands:
    /// public keys (config, agent, defaults), then password, then
    /// keyboard-interactive.
    async fn authenticate(
        &mut self,
        handle: &mut client::Handle<TrustHandler>,
    ) -> Result<(), SshError> {
        let username = self.config.username.clone();

        let provider = CredentialProvider::new(self.config.key_file.clone());
        let mut credentials = provider.enumerate().await;
        debug!(
            "{} public key candidate(s) for {}",
            credentials.candidates.len(),
            username
        );

        for candidate in std::mem::take(&mut credentials.candidates) {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SshError::Shutdown);
            }
            let desc = candidate.describe();
            let attempt = match candidate {
                CredentialCandidate::ConfigKey { key, .. }
                | CredentialCandidate::DefaultKey { key, .. } => {
                    self.with_shutdown(handle.authenticate_publickey(
                        &username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    ))
                    .await
                }
                CredentialCandidate::AgentKey { key } => match credentials.agent.as_mut() {
                    Some(agent) => {
                        self.with_shutdown(agent.authenticate_key(handle, &username, &key))
                            .await
                    }
                    None => continue,
                },
            };
            match attempt {
                Ok(result) if result.success() => {
                    info!("public key authentication succeeded with {}", desc);
                    return Ok(());
                }
                Ok(_) => {
                    debug!("{} rejected by server", desc);
                    self.output.receive_data(
                        format!("Public key auth failed with {}: rejected by server\r\n", desc)
                            .as_bytes(),
                    );
                }
                Err(e) if e.is_shutdown() => return Err(e),
                Err(e) => {
                    debug!("{} errored: {}", desc, e);
                    self.output.receive_data(
                        format!("Public key auth failed with {}: {}\r\n", desc, e).as_bytes(),
                    );
                }
            }
        }

        let mut password = self.config.password.take().map(Zeroizing::new);
        if password.is_none() {
            password = Some(self.collect_password().await?);
        }
        if let Some(password) = password {
            let attempt = self
                .with_shutdown(handle.authenticate_password(&username, password.as_str()))
                .await;
            match attempt {
                Ok(result) if result.success() => {
                    info!("password authentication succeeded for {}", username);
                    return Ok(());
                }
                Ok(_) => {
                    self.output
                        .receive_data(b"Password authentication failed.\r\n");
                }
                Err(e) if e.is_shutdown() => return Err(e),
                Err(e) => {
                    self.output.receive_data(
                        format!("Password authentication failed: {}\r\n", e).as_bytes(),
                    );
                }
            }
        }

        if self.keyboard_interactive(handle, &username).await? {
            return Ok(());
        }
        Err(SshError::AuthenticationFailed)
    }

    /// Prompt for and collect a password over the bridge in masked mode.
    /// Two terminators reach the output sink: the bridge echoes one when
    /// the line completes, and a second follows here after the wait.
    /// Shutdown aborts before the second echo and before any
    /// authentication attempt.
    async fn collect_password(&self) -> Result<Zeroizing<String>, SshError> {
        let prompt = format!(
            "Password for {}@{} on port {}: ",
            self.config.username, self.config.host, self.config.port
        );
        self.output.receive_data(prompt.as_bytes());
        self.bridge.set_password_entry(true);
        let line = self.bridge.read_line().await;
        self.bridge.set_password_entry(false);
        let line = line?;
        self.output.receive_data(b"\r\n");
        Ok(Zeroizing::new(line))
    }

    /// One keyboard-interactive conversation, prompt rounds included.
    /// Prompts marked no-echo run the bridge in masked mode.
    async fn keyboard_interactive(
        &self,
        handle: &mut client::Handle<TrustHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let start = self
            .with_shutdown(handle.authenticate_keyboard_interactive_start(username, None::<String>))
            .await;
        let mut reply = match start {
            Ok(reply) => reply,
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                self.output
                    .receive_data(format!("Keyboard-interactive failed: {}\r\n", e).as_bytes());
                return Ok(false);
            }
        };
        loop {
            match reply {
                KeyboardInteractiveAuthResponse::Success => {
                    info!("keyboard-interactive authentication succeeded");
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    debug!("keyboard-interactive rejected by server");
                    self.output
                        .receive_data(b"Keyboard-interactive authentication failed.\r\n");
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    if !name.is_empty() {
                        self.output
                            .receive_data(format!("{}\r\n", name).as_bytes());
                    }
                    if !instructions.is_empty() {
                        self.output
                            .receive_data(format!("{}\r\n", instructions).as_bytes());
                    }
                    let mut responses = Vec::with_capacity(prompts.len());
                    for prompt in &prompts {
                        self.output
                            .receive_data(format!("{}\r\n", prompt.prompt).as_bytes());
                        self.bridge.set_password_entry(!prompt.echo);
                        let line = self.bridge.read_line().await;
                        self.bridge.set_password_entry(false);
                        responses.push(line?);
                    }
                    let round = self
                        .with_shutdown(handle.authenticate_keyboard_interactive_respond(responses))
                        .await;
                    reply = match round {
                        Ok(reply) => reply,
                        Err(e) if e.is_shutdown() => return Err(e),
                        Err(e) => {
                            self.output.receive_data(
                                format!("Keyboard-interactive failed: {}\r\n", e).as_bytes(),
                            );
                            return Ok(false);
                        }
                    };
                }
            }
        }
    }

    /// Pump bytes both ways until the channel closes or shutdown is
    /// requested. Remote stderr is folded into the same output stream.
    async fn relay(
        &self,
        channel: &mut Channel<client::Msg>,
        input_rx: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), SshError> {
        loop {
            tokio::select! {
                Some(data) = input_rx.recv() => {
                    channel.data(&data[..]).await?;
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            self.output.receive_data(&data);
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1 {
                                self.output.receive_data(&data);
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("remote exit status {}", exit_status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            debug!("remote exit signal {:?}", signal_name);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("ssh worker {} channel closed by remote", self.conn_id);
                            return Ok(());
                        }
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if !self.running.load(Ordering::SeqCst) {
                        debug!("ssh worker {} leaving relay on shutdown", self.conn_id);
                        return Ok(());
                    }
                }
            }
        }
    }
}
