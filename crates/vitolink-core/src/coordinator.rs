//! Polling coordinator
//!
//! Owns the set of registered datapoints and drives one protocol engine.
//! Each polling cycle either flushes pending writes (every dirty datapoint
//! gets a WRITE followed by a verification READ, and ordinary reads are
//! skipped that cycle) or polls every registered datapoint with a plain
//! READ. Completed transfers are correlated back to their datapoint through
//! the token carried in each request.

use tracing::{debug, error, warn};

use crate::datapoint::Datapoint;
use crate::optolink::{
    Optolink, OptolinkError, Token, TransferError, TransferEvent, MAX_QUEUE_LENGTH,
};
use crate::time::Millis;
use crate::value::{self, Value};

/// How many failed write verifications are tolerated before the pending
/// value is dropped, so one unwritable datapoint cannot starve the rest.
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Handle identifying a registered datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatapointHandle(usize);

/// Handler invoked for every transfer error the engine reports.
pub type ErrorHandler = Box<dyn FnMut(&Datapoint, TransferError) + Send>;

/// Transfer purpose, packed into the low token bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Read,
    WriteAck,
    Verify,
}

fn make_token(index: usize, purpose: Purpose) -> Token {
    let tag = match purpose {
        Purpose::Read => 0,
        Purpose::WriteAck => 1,
        Purpose::Verify => 2,
    };
    ((index as Token) << 2) | tag
}

fn split_token(token: Token) -> (usize, Option<Purpose>) {
    let purpose = match token & 0b11 {
        0 => Some(Purpose::Read),
        1 => Some(Purpose::WriteAck),
        2 => Some(Purpose::Verify),
        _ => None,
    };
    ((token >> 2) as usize, purpose)
}

/// A value waiting to be written and verified.
#[derive(Debug)]
struct PendingWrite {
    /// Encoded cell bytes, also the expected verification payload
    bytes: Vec<u8>,
    /// Failed verification count so far
    attempts: u32,
    /// When the value was set (dirty marker)
    since: Millis,
}

struct Slot {
    dp: Datapoint,
    observed: Option<Value>,
    pending: Option<PendingWrite>,
}

/// Drives a protocol engine over a set of registered datapoints.
pub struct Coordinator<P> {
    engine: P,
    slots: Vec<Slot>,
    on_error: Option<ErrorHandler>,
}

impl<P: Optolink> Coordinator<P> {
    /// Create a coordinator around an engine.
    pub fn new(engine: P) -> Self {
        Self {
            engine,
            slots: Vec::new(),
            on_error: None,
        }
    }

    /// Reset the engine to its initial synchronization state.
    pub fn begin(&mut self, now: Millis) {
        self.engine.begin(now);
    }

    /// Install the process-wide transfer error handler.
    pub fn on_error(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    /// Add a datapoint to the polled set.
    pub fn register_datapoint(&mut self, dp: Datapoint) -> Result<DatapointHandle, OptolinkError> {
        if !dp.is_valid() {
            return Err(OptolinkError::InvalidLength(dp.length));
        }
        debug!(name = %dp.name, address = dp.address, length = dp.length, "registering datapoint");
        self.slots.push(Slot {
            dp,
            observed: None,
            pending: None,
        });
        Ok(DatapointHandle(self.slots.len() - 1))
    }

    /// Last observed value of a datapoint.
    pub fn value(&self, handle: DatapointHandle) -> Option<Value> {
        self.slots.get(handle.0).and_then(|s| s.observed)
    }

    /// Whether a datapoint has a value pending write.
    pub fn is_dirty(&self, handle: DatapointHandle) -> bool {
        self.slots
            .get(handle.0)
            .map(|s| s.pending.is_some())
            .unwrap_or(false)
    }

    /// Set a value to be written on the next cycle. The dirty marker is
    /// cleared only once a verification read returns the exact encoded bytes.
    pub fn set_value(
        &mut self,
        handle: DatapointHandle,
        value: Value,
        now: Millis,
    ) -> Result<(), OptolinkError> {
        let slot = self
            .slots
            .get_mut(handle.0)
            .ok_or(OptolinkError::UnknownDatapoint)?;
        if !slot.dp.writeable {
            return Err(OptolinkError::NotWriteable);
        }
        let mut bytes = vec![0u8; slot.dp.length];
        value::encode(slot.dp.kind, slot.dp.div_ratio, &value, &mut bytes)
            .ok_or(OptolinkError::Encode)?;
        debug!(name = %slot.dp.name, ?bytes, "value pending write");
        slot.pending = Some(PendingWrite {
            bytes,
            attempts: 0,
            since: now,
        });
        Ok(())
    }

    /// Schedule one polling cycle: writes plus verification reads when any
    /// datapoint is dirty, otherwise one plain read per datapoint.
    ///
    /// Rejected with `QueueFull` before anything is enqueued when the whole
    /// cycle does not fit the engine queue, so a failed call never leaves a
    /// write queued without its verification read.
    pub fn update(&mut self) -> Result<(), OptolinkError> {
        let dirty = self.slots.iter().filter(|s| s.pending.is_some()).count();
        let any_dirty = dirty > 0;
        let required = if any_dirty { 2 * dirty } else { self.slots.len() };
        if self.engine.pending() + required > MAX_QUEUE_LENGTH {
            return Err(OptolinkError::QueueFull);
        }
        if any_dirty {
            for (index, slot) in self.slots.iter().enumerate() {
                let Some(pending) = &slot.pending else {
                    continue;
                };
                self.engine.enqueue_write(
                    slot.dp.address,
                    &pending.bytes,
                    make_token(index, Purpose::WriteAck),
                )?;
                self.engine.enqueue_read(
                    slot.dp.address,
                    slot.dp.length,
                    make_token(index, Purpose::Verify),
                )?;
            }
        } else {
            for (index, slot) in self.slots.iter().enumerate() {
                self.engine.enqueue_read(
                    slot.dp.address,
                    slot.dp.length,
                    make_token(index, Purpose::Read),
                )?;
            }
        }
        Ok(())
    }

    /// Advance the engine by one tick and fold any completed transfer back
    /// into the datapoint it belongs to.
    pub fn poll(&mut self, now: Millis) -> Result<(), OptolinkError> {
        let Some(event) = self.engine.poll(now)? else {
            return Ok(());
        };
        match event {
            TransferEvent::Data { token, bytes } => self.handle_data(token, &bytes, now),
            TransferEvent::Error { token, error } => {
                let (index, _) = split_token(token);
                if let Some(slot) = self.slots.get(index) {
                    warn!(name = %slot.dp.name, %error, "transfer failed");
                    if let Some(handler) = &mut self.on_error {
                        handler(&slot.dp, error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Access the underlying engine.
    pub fn engine_mut(&mut self) -> &mut P {
        &mut self.engine
    }

    fn handle_data(&mut self, token: Token, bytes: &[u8], now: Millis) {
        let (index, purpose) = split_token(token);
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(token, "completed transfer for unknown datapoint");
            return;
        };
        match purpose {
            Some(Purpose::Read) => match value::decode(slot.dp.kind, slot.dp.div_ratio, bytes) {
                Some(value) => {
                    debug!(name = %slot.dp.name, ?value, "datapoint updated");
                    slot.observed = Some(value);
                }
                None => warn!(
                    name = %slot.dp.name,
                    received = bytes.len(),
                    "short read response"
                ),
            },
            Some(Purpose::WriteAck) => {
                // Diagnostic only: the verification read is authoritative.
                if bytes.first() == Some(&0x00) {
                    debug!(name = %slot.dp.name, "write acknowledged");
                } else {
                    warn!(name = %slot.dp.name, ack = ?bytes.first(), "write not acknowledged");
                }
            }
            Some(Purpose::Verify) => {
                let Some(pending) = &mut slot.pending else {
                    debug!(name = %slot.dp.name, "verification without pending write");
                    return;
                };
                if bytes == pending.bytes.as_slice() {
                    debug!(
                        name = %slot.dp.name,
                        dirty_ms = now.elapsed_since(pending.since),
                        "write verified"
                    );
                    slot.observed = value::decode(slot.dp.kind, slot.dp.div_ratio, bytes);
                    slot.pending = None;
                } else {
                    pending.attempts += 1;
                    if pending.attempts >= MAX_WRITE_ATTEMPTS {
                        error!(
                            name = %slot.dp.name,
                            attempts = pending.attempts,
                            "write verification failed repeatedly, dropping value"
                        );
                        slot.pending = None;
                    } else {
                        warn!(
                            name = %slot.dp.name,
                            attempts = pending.attempts,
                            "write verification mismatch, will retry"
                        );
                    }
                }
            }
            None => warn!(token, "completed transfer with malformed token"),
        }
    }
}
