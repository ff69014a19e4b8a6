//! Optolink errors

use thiserror::Error;

/// Errors that can occur while operating an Optolink engine
#[derive(Error, Debug)]
pub enum OptolinkError {
    /// The serial link misbehaved in a way that is not a plain I/O error
    #[error("serial link error: {0}")]
    Link(String),

    /// The request queue is at capacity
    #[error("request queue full")]
    QueueFull,

    /// A request or datapoint length outside `1..=MAX_DP_LENGTH`
    #[error("invalid datapoint length: {0}")]
    InvalidLength(usize),

    /// Attempt to write a read-only datapoint
    #[error("datapoint is not writeable")]
    NotWriteable,

    /// A handle that does not refer to a registered datapoint
    #[error("unknown datapoint handle")]
    UnknownDatapoint,

    /// The value does not fit the datapoint's kind or range
    #[error("value cannot be encoded for this datapoint")]
    Encode,

    /// I/O failure on the serial port
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Terminal failure of a single queued transfer, reported alongside its
/// correlation token.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The queue did not drain within the stale-queue window, or the
    /// controller stopped answering.
    #[error("transfer timed out")]
    Timeout,

    /// The controller rejected the request (P300 NACK).
    #[error("request rejected by controller")]
    Nack,

    /// The response frame failed its checksum (P300).
    #[error("response checksum mismatch")]
    Crc,

    /// The response frame had an impossible length.
    #[error("response length mismatch")]
    Length,
}
