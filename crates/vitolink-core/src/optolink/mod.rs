//! Optolink protocol engines
//!
//! Implements the three incompatible framing dialects spoken by Vitotronic
//! controllers over the optical serial interface: KW, GWG and P300. Each
//! engine is a non-blocking state machine driven by repeated [`Optolink::poll`]
//! calls from a single host loop; suspension between protocol steps is held
//! as retained state (current state, timestamps, partial receive buffer),
//! never as a blocked call.

mod error;
pub mod gwg;
pub mod kw;
pub mod link;
pub mod p300;
mod queue;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{OptolinkError, TransferError};
pub use gwg::OptolinkGwg;
pub use kw::OptolinkKw;
pub use link::{configure_port, open_port, SerialLink, SerialPortLink, DEFAULT_BAUD_RATE};
pub use p300::OptolinkP300;
pub use queue::{RequestQueue, Token, TransferRequest, MAX_QUEUE_LENGTH};

use crate::time::Millis;

/// Maximum byte width of a datapoint cell and of the receive buffer
pub const MAX_DP_LENGTH: usize = 9;

/// READY byte the controller sends when it accepts a request
pub const READY: u8 = 0x05;

/// Acknowledgement byte sent in direct reply to READY (KW sync, GWG ack)
pub const ACK: u8 = 0x01;

/// Stale-queue watchdog window: with requests pending but none completing
/// within this time, the engine reports a timeout and resynchronizes.
pub const STALE_QUEUE_TIMEOUT_MS: u32 = 5000;

/// Terminal outcome of one dequeued transfer request.
///
/// Exactly one event is produced per request that leaves the queue, carrying
/// the caller's correlation token. GWG protocol-level rejections are the one
/// exception: those entries are dropped with a warning and no event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The transfer completed. For reads `bytes` holds the cell content;
    /// for writes it holds the controller's single acknowledgement byte
    /// (`0x00` = accepted).
    Data {
        /// Correlation token from the originating request
        token: Token,
        /// Received bytes
        bytes: Vec<u8>,
    },
    /// The transfer failed terminally.
    Error {
        /// Correlation token from the originating request
        token: Token,
        /// Failure classification
        error: TransferError,
    },
}

/// Outcome of one state handler inside a `poll` invocation.
///
/// `Continue` re-dispatches on the new state within the same tick (cascading
/// transitions); `Yield` ends the tick, optionally delivering an event.
pub(crate) enum Step {
    Continue,
    Yield(Option<TransferEvent>),
}

/// Shared contract of the three dialect engines.
///
/// `poll` performs a bounded amount of work and returns promptly — it never
/// sleeps or blocks on the serial link. The host supplies a monotonic
/// millisecond timestamp on every call; all deadlines are measured against
/// it with wraparound-safe subtraction.
pub trait Optolink {
    /// Reset the engine to its initial synchronization state, clearing
    /// buffers and timers. Queued requests are kept.
    fn begin(&mut self, now: Millis);

    /// Advance the state machine by one non-blocking step.
    ///
    /// Returns `Ok(Some(event))` when a queued request reached a terminal
    /// outcome during this tick. Link I/O failures surface as `Err`; protocol
    /// faults (timeouts, framing) are handled internally by resynchronizing.
    fn poll(&mut self, now: Millis) -> Result<Option<TransferEvent>, OptolinkError>;

    /// Queue a read of `length` bytes at `address`.
    fn enqueue_read(
        &mut self,
        address: u16,
        length: usize,
        token: Token,
    ) -> Result<(), OptolinkError>;

    /// Queue a write of `data` to `address`.
    fn enqueue_write(
        &mut self,
        address: u16,
        data: &[u8],
        token: Token,
    ) -> Result<(), OptolinkError>;

    /// Number of requests still pending.
    fn pending(&self) -> usize;
}
