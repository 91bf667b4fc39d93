//! Interactive console bridge
//!
//! Turns raw teletype keystrokes into whole lines for the worker: host
//! trust prompts, the password prompt, and keyboard-interactive challenges
//! all read through here. Once the remote shell channel is open the bridge
//! goes inert; keystrokes bypass it entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::error::SshError;
use crate::output::OutputSink;

/// Completed lines waiting for the worker. A full queue drops new lines
/// rather than blocking a keystroke.
pub(crate) const INPUT_QUEUE_DEPTH: usize = 2048;

/// How long any blocking wait sleeps before re-checking the running flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct InteractiveBridge {
    output: Arc<dyn OutputSink>,
    running: Arc<AtomicBool>,
    pending: Mutex<String>,
    password_entry: AtomicBool,
    line_tx: mpsc::Sender<String>,
    line_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl InteractiveBridge {
    pub fn new(output: Arc<dyn OutputSink>, running: Arc<AtomicBool>) -> Self {
        Self::with_queue_depth(output, running, INPUT_QUEUE_DEPTH)
    }

    /// Queue depth override for tests.
    pub fn with_queue_depth(
        output: Arc<dyn OutputSink>,
        running: Arc<AtomicBool>,
        depth: usize,
    ) -> Self {
        let (line_tx, line_rx) = mpsc::channel(depth);
        Self {
            output,
            running,
            pending: Mutex::new(String::new()),
            password_entry: AtomicBool::new(false),
            line_tx,
            line_rx: tokio::sync::Mutex::new(line_rx),
        }
    }

    /// Process one chunk of keystrokes.
    ///
    /// Per byte: CR or LF completes the pending line, BS or DEL erases one
    /// character, other ASCII bytes append, and non-ASCII bytes are
    /// discarded from the line (the console is a 7-bit device). Echo is the
    /// whole chunk verbatim, except during password entry where only the
    /// line terminator is acknowledged.
    pub fn feed(&self, data: &[u8]) {
        let mut completed = false;
        {
            let mut pending = self.pending.lock();
            for &byte in data {
                match byte {
                    b'\r' | b'\n' => {
                        let line = std::mem::take(&mut *pending);
                        if self.line_tx.try_send(line).is_err() {
                            debug!("Input queue full, dropping line");
                        }
                        completed = true;
                    }
                    0x08 | 0x7f => {
                        pending.pop();
                    }
                    b if b.is_ascii() => pending.push(b as char),
                    _ => {}
                }
            }
        }

        if self.password_entry.load(Ordering::SeqCst) {
            if completed {
                self.output.receive_data(b"\r\n");
            }
        } else {
            self.output.receive_data(data);
        }
    }

    /// Toggle echo suppression while a secret is being typed.
    pub fn set_password_entry(&self, on: bool) {
        self.password_entry.store(on, Ordering::SeqCst);
    }

    /// Block until a complete line arrives, waking every poll interval to
    /// check for shutdown.
    pub async fn read_line(&self) -> Result<String, SshError> {
        let mut rx = self.line_rx.lock().await;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SshError::Shutdown);
            }
            match timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Some(line)) => return Ok(line),
                Ok(None) => return Err(SshError::Shutdown),
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BufferSink;
    use std::time::Instant;

    fn bridge() -> (Arc<BufferSink>, Arc<AtomicBool>, InteractiveBridge) {
        let sink = Arc::new(BufferSink::new());
        let running = Arc::new(AtomicBool::new(true));
        let bridge = InteractiveBridge::new(sink.clone(), running.clone());
        (sink, running, bridge)
    }

    #[test]
    fn echoes_whole_chunk_verbatim() {
        let (sink, _running, bridge) = bridge();
        bridge.feed(b"AB\rC");
        assert_eq!(sink.drain(), b"AB\rC");
    }

    #[test]
    fn password_entry_suppresses_echo_except_terminator() {
        let (sink, _running, bridge) = bridge();
        bridge.set_password_entry(true);
        bridge.feed(b"secret");
        assert!(sink.is_empty());
        bridge.feed(b"\r");
        assert_eq!(sink.drain(), b"\r\n");
    }

    #[tokio::test]
    async fn backspace_and_delete_edit_the_line() {
        let (_sink, _running, bridge) = bridge();
        bridge.feed(b"abq\x08x\x7fc\r");
        assert_eq!(bridge.read_line().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn cr_and_lf_both_complete_lines() {
        let (_sink, _running, bridge) = bridge();
        bridge.feed(b"one\n");
        bridge.feed(b"two\r");
        assert_eq!(bridge.read_line().await.unwrap(), "one");
        assert_eq!(bridge.read_line().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn non_ascii_dropped_from_line_but_echoed() {
        let (sink, _running, bridge) = bridge();
        bridge.feed(b"a\xffb\r");
        assert_eq!(bridge.read_line().await.unwrap(), "ab");
        assert_eq!(sink.drain(), b"a\xffb\r");
    }

    #[tokio::test]
    async fn full_queue_drops_lines_silently() {
        let sink = Arc::new(BufferSink::new());
        let running = Arc::new(AtomicBool::new(true));
        let bridge = InteractiveBridge::with_queue_depth(sink, running.clone(), 1);

        bridge.feed(b"kept\rdropped\r");
        assert_eq!(bridge.read_line().await.unwrap(), "kept");

        running.store(false, Ordering::SeqCst);
        assert!(matches!(
            bridge.read_line().await,
            Err(SshError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn shutdown_during_wait_returns_within_poll_interval() {
        let (_sink, running, bridge) = bridge();

        running.store(false, Ordering::SeqCst);
        assert!(matches!(bridge.read_line().await, Err(SshError::Shutdown)));

        running.store(true, Ordering::SeqCst);
        let flag = running.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            flag.store(false, Ordering::SeqCst);
        });
        let started = Instant::now();
        assert!(bridge.read_line().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
