//! Output seam between the SSH core and the rest of the emulator
//!
//! Everything the remote side (or the core itself) wants printed goes
//! through one callback. The terminal renderer implements it; tests and
//! headless embedders use [`BufferSink`].

use parking_lot::Mutex;

/// Receives bytes destined for the teletype console.
///
/// Called from the worker thread and, for local echo, from the caller's
/// thread. Implementations must not block for long; the worker's relay loop
/// runs on the same thread as the SSH session.
pub trait OutputSink: Send + Sync {
    fn receive_data(&self, data: &[u8]);
}

impl<F> OutputSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn receive_data(&self, data: &[u8]) {
        self(data)
    }
}

/// Sink that accumulates output in memory.
#[derive(Default)]
pub struct BufferSink {
    data: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far, decoded lossily for inspection.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data.lock()).into_owned()
    }

    /// Take the accumulated bytes, leaving the sink empty.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl OutputSink for BufferSink {
    fn receive_data(&self, data: &[u8]) {
        self.data.lock().extend_from_slice(data);
    }
}
