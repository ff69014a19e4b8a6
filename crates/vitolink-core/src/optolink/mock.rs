//! Scripted serial link for engine tests

use std::collections::VecDeque;

use super::{OptolinkError, SerialLink};

/// In-memory [`SerialLink`] with scripted receive bytes and captured
/// transmit bytes. Time never passes here; tests control it through the
/// `Millis` values they pass to `poll`.
#[derive(Debug, Default)]
pub(crate) struct MockLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script bytes to arrive from the controller.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Take everything the engine transmitted since the last call.
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

/// Route engine logs to the test writer, filtered by `RUST_LOG`. Safe to
/// call from every test; only the first call installs the subscriber.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl SerialLink for MockLink {
    fn available(&mut self) -> Result<usize, OptolinkError> {
        Ok(self.rx.len())
    }

    fn peek(&mut self) -> Result<Option<u8>, OptolinkError> {
        Ok(self.rx.front().copied())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, OptolinkError> {
        Ok(self.rx.pop_front())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), OptolinkError> {
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), OptolinkError> {
        self.rx.clear();
        Ok(())
    }
}
