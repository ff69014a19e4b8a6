//! Pending transfer queue
//!
//! A bounded FIFO of transfer requests, exclusively owned by one engine
//! instance. The engine only ever inspects the front entry; entries leave
//! the queue on completion, on watchdog timeout, or on protocol-level
//! rejection (GWG).

use std::collections::VecDeque;

use super::{OptolinkError, MAX_DP_LENGTH};

/// Maximum number of queued requests
pub const MAX_QUEUE_LENGTH: usize = 64;

/// Opaque correlation token, chosen by the caller and passed back unchanged
/// with the transfer outcome.
pub type Token = u32;

/// One pending read or write transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Cell address. KW/P300: flat 16-bit address. GWG: `(function << 8) | physical`.
    pub address: u16,
    /// Byte width of the cell, `1..=MAX_DP_LENGTH`.
    pub length: usize,
    /// Direction flag, fixed per request.
    pub write: bool,
    /// Payload for writes, exactly `length` bytes. Empty for reads.
    pub data: Vec<u8>,
    /// Correlation token returned with the outcome.
    pub token: Token,
}

impl TransferRequest {
    /// Build a read request.
    pub fn read(address: u16, length: usize, token: Token) -> Result<Self, OptolinkError> {
        if length == 0 || length > MAX_DP_LENGTH {
            return Err(OptolinkError::InvalidLength(length));
        }
        Ok(Self {
            address,
            length,
            write: false,
            data: Vec::new(),
            token,
        })
    }

    /// Build a write request carrying `data` as the cell payload.
    pub fn write(address: u16, data: &[u8], token: Token) -> Result<Self, OptolinkError> {
        if data.is_empty() || data.len() > MAX_DP_LENGTH {
            return Err(OptolinkError::InvalidLength(data.len()));
        }
        Ok(Self {
            address,
            length: data.len(),
            write: true,
            data: data.to_vec(),
            token,
        })
    }
}

/// FIFO of pending requests, bounded at [`MAX_QUEUE_LENGTH`].
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<TransferRequest>,
}

impl RequestQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a request, rejecting when the queue is at capacity.
    pub fn push_back(&mut self, request: TransferRequest) -> Result<(), OptolinkError> {
        if self.entries.len() >= MAX_QUEUE_LENGTH {
            return Err(OptolinkError::QueueFull);
        }
        self.entries.push_back(request);
        Ok(())
    }

    /// The request currently being serviced.
    pub fn front(&self) -> Option<&TransferRequest> {
        self.entries.front()
    }

    /// Remove and return the front request.
    pub fn pop_front(&mut self) -> Option<TransferRequest> {
        self.entries.pop_front()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = RequestQueue::new();
        queue
            .push_back(TransferRequest::read(0x1000, 1, 1).unwrap())
            .unwrap();
        queue
            .push_back(TransferRequest::read(0x2000, 2, 2).unwrap())
            .unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap().address, 0x1000);
        assert_eq!(queue.pop_front().unwrap().token, 1);
        assert_eq!(queue.pop_front().unwrap().token, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let mut queue = RequestQueue::new();
        for i in 0..MAX_QUEUE_LENGTH {
            queue
                .push_back(TransferRequest::read(0, 1, i as Token).unwrap())
                .unwrap();
        }
        let overflow = queue.push_back(TransferRequest::read(0, 1, 999).unwrap());
        assert!(matches!(overflow, Err(OptolinkError::QueueFull)));
    }

    #[test]
    fn test_length_validation() {
        assert!(TransferRequest::read(0, 0, 0).is_err());
        assert!(TransferRequest::read(0, MAX_DP_LENGTH + 1, 0).is_err());
        assert!(TransferRequest::write(0, &[], 0).is_err());
        assert!(TransferRequest::write(0, &[1, 2], 0).is_ok());
    }
}
