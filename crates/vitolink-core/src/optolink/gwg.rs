//! GWG dialect engine
//!
//! Spoken by the oldest GWG-series boilers. Addressing carries an operation
//! class ("function") in the high byte of the datapoint address; only the
//! low byte reaches the wire as the physical address. Frames end in an 0x04
//! delimiter. Consecutive requests may be chained in burst mode without
//! waiting for a new READY byte.
//!
//! The acknowledgement byte (0x01) is transmitted only in direct reaction to
//! a READY byte (0x05) received while idle, never from any other state,
//! including burst continuations.

use tracing::{debug, warn};

use super::{
    Optolink, OptolinkError, RequestQueue, SerialLink, Step, Token, TransferError, TransferEvent,
    TransferRequest, ACK, MAX_DP_LENGTH, READY, STALE_QUEUE_TIMEOUT_MS,
};
use crate::time::Millis;

/// The complete response must arrive within this window after the request.
/// Conservative for 4800 baud to avoid false timeouts from scheduler jitter.
const RX_TOTAL_TIMEOUT_MS: u32 = 800;

/// Maximum allowed gap between two consecutive response bytes. Larger gaps
/// indicate a broken or aborted frame.
const RX_INTERBYTE_TIMEOUT_MS: u32 = 80;

/// Trailing delimiter of every GWG request frame
const FRAME_DELIMITER: u8 = 0x04;

/// Direction fixed by a GWG function code: `Some(true)` write-only,
/// `Some(false)` read-only, `None` for the legacy function 0 where the
/// request's write flag alone decides.
fn function_direction(function: u8) -> Option<Option<bool>> {
    match function {
        0x00 => Some(None),        // legacy
        0x01 => Some(Some(false)), // VIRTUAL READ
        0x02 => Some(Some(true)),  // VIRTUAL WRITE
        0x03 => Some(Some(false)), // PHYSICAL READ
        0x04 => Some(Some(true)),  // PHYSICAL WRITE
        0x05 => Some(Some(false)), // EEPROM READ
        0x06 => Some(Some(true)),  // EEPROM WRITE
        0x49 => Some(Some(false)), // PHYSICAL XRAM READ
        0x50 => Some(Some(true)),  // PHYSICAL XRAM WRITE
        0x51 => Some(Some(false)), // PHYSICAL PORT READ
        0x52 => Some(Some(true)),  // PHYSICAL PORT WRITE
        0x53 => Some(Some(false)), // PHYSICAL BE READ
        0x54 => Some(Some(true)),  // PHYSICAL BE WRITE
        0x65 => Some(Some(false)), // PHYSICAL KMBUS RAM READ
        0x67 => Some(Some(false)), // PHYSICAL KMBUS EEPROM READ
        _ => None,
    }
}

/// Telegram type byte for a function code. Function 0 selects the legacy
/// physical read/write pair by the write flag alone.
fn telegram_type(function: u8, write: bool) -> Option<u8> {
    match function {
        0x00 => Some(if write { 0xC8 } else { 0xCB }),
        0x01 => Some(0xC7),
        0x02 => Some(0xC4),
        0x03 => Some(0xCB),
        0x04 => Some(0xC8),
        0x05 => Some(0xAE),
        0x06 => Some(0xAD),
        0x49 => Some(0xC5),
        0x50 => Some(0xC3),
        0x51 => Some(0x6E),
        0x52 => Some(0x6D),
        0x53 => Some(0x9E),
        0x54 => Some(0x9D),
        0x65 => Some(0x33),
        0x67 => Some(0x43),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GwgState {
    Undef,
    Init,
    Idle,
    Send,
    Receive,
}

/// GWG protocol engine.
pub struct OptolinkGwg<L> {
    link: L,
    state: GwgState,
    queue: RequestQueue,
    last_millis: Millis,
    send_millis: Millis,
    last_rx_millis: Millis,
    burst_active: bool,
    rcv_buffer: [u8; MAX_DP_LENGTH],
    rcv_filled: usize,
    rcv_expected: usize,
}

impl<L: SerialLink> OptolinkGwg<L> {
    /// Create an engine over `link`. Call [`Optolink::begin`] before polling.
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: GwgState::Undef,
            queue: RequestQueue::new(),
            last_millis: Millis(0),
            send_millis: Millis(0),
            last_rx_millis: Millis(0),
            burst_active: false,
            rcv_buffer: [0; MAX_DP_LENGTH],
            rcv_filled: 0,
            rcv_expected: 0,
        }
    }

    /// Access the underlying serial link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Abort the current frame and resynchronize, flushing stale input so
    /// late bytes are not misread as part of the next response.
    fn fault_reset(&mut self, now: Millis) -> Result<(), OptolinkError> {
        self.rcv_filled = 0;
        self.state = GwgState::Init;
        self.burst_active = false;
        self.link.discard_input()?;
        self.last_millis = now;
        Ok(())
    }

    /// Discard front queue entries whose function is unsupported or whose
    /// fixed direction conflicts with the request's write flag, until a
    /// valid entry is found or the queue empties.
    fn drop_invalid_entries(&mut self) -> bool {
        while let Some(request) = self.queue.front() {
            let function = (request.address >> 8) as u8;
            match function_direction(function) {
                None => {
                    warn!(
                        function,
                        address = request.address,
                        "discarding datapoint with unsupported function"
                    );
                    self.queue.pop_front();
                }
                Some(Some(requires_write)) if requires_write != request.write => {
                    warn!(
                        function,
                        address = request.address,
                        write = request.write,
                        "discarding datapoint with direction mismatch"
                    );
                    self.queue.pop_front();
                }
                _ => return true,
            }
        }
        false
    }

    fn init(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        // Wait for a READY byte, discarding everything else.
        if let Some(byte) = self.link.read_byte()? {
            if byte == READY {
                self.state = GwgState::Idle;
                self.last_millis = now;
            }
            return Ok(Step::Continue);
        }
        Ok(Step::Yield(None))
    }

    fn idle(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if let Some(byte) = self.link.read_byte()? {
            if byte == READY {
                self.last_millis = now;
                if !self.queue.is_empty() {
                    // Start (or restart) a burst sequence. The ack is sent
                    // here and nowhere else.
                    self.burst_active = true;
                    self.link.write_all(&[ACK])?;
                    self.state = GwgState::Send;
                    return Ok(Step::Continue);
                }
                self.burst_active = false;
            } else {
                debug!(byte, "received unexpected byte while idle");
            }
        }
        Ok(Step::Yield(None))
    }

    fn send(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if !self.drop_invalid_entries() {
            self.burst_active = false;
            self.state = GwgState::Idle;
            return Ok(Step::Yield(None));
        }

        // Late bytes from the previous exchange must not leak into this
        // request's response.
        self.link.discard_input()?;

        let request = self
            .queue
            .front()
            .ok_or_else(|| OptolinkError::Link("send without request".into()))?;
        let function = (request.address >> 8) as u8;
        let physical = (request.address & 0xFF) as u8;
        let length = request.length;

        let Some(telegram) = telegram_type(function, request.write) else {
            warn!(
                function,
                address = request.address,
                "discarding datapoint with unknown telegram mapping"
            );
            self.queue.pop_front();
            return Ok(Step::Continue);
        };

        let mut frame = [0u8; MAX_DP_LENGTH + 4];
        frame[0] = telegram;
        frame[1] = physical;
        frame[2] = length as u8;
        frame[3] = FRAME_DELIMITER;
        let frame_len = if request.write {
            frame[4..4 + length].copy_from_slice(&request.data);
            self.rcv_expected = 1;
            4 + length
        } else {
            self.rcv_expected = length;
            4
        };
        debug!(
            telegram,
            function,
            physical,
            length,
            write = request.write,
            "sending GWG request"
        );
        self.link.write_all(&frame[..frame_len])?;

        self.rcv_filled = 0;
        self.send_millis = now;
        self.last_rx_millis = now;
        self.last_millis = now;
        self.state = GwgState::Receive;
        Ok(Step::Yield(None))
    }

    fn receive(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        while let Some(byte) = self.link.read_byte()? {
            if self.rcv_filled >= MAX_DP_LENGTH {
                warn!(filled = self.rcv_filled, "receive buffer overflow");
                self.fault_reset(now)?;
                return Ok(Step::Yield(None));
            }
            self.rcv_buffer[self.rcv_filled] = byte;
            self.rcv_filled += 1;
            self.last_rx_millis = now;
        }

        if self.rcv_filled == self.rcv_expected {
            let request = self
                .queue
                .pop_front()
                .ok_or_else(|| OptolinkError::Link("receive without request".into()))?;
            debug!(
                address = request.address,
                length = self.rcv_filled,
                elapsed_ms = now.elapsed_since(self.send_millis),
                "GWG transfer complete"
            );
            let bytes = self.rcv_buffer[..self.rcv_filled].to_vec();
            self.last_millis = now;

            // Burst continuation: the next request goes straight out without
            // a new READY byte and without an ack.
            if self.burst_active && !self.queue.is_empty() {
                self.state = GwgState::Send;
            } else {
                self.burst_active = false;
                self.state = GwgState::Idle;
            }
            return Ok(Step::Yield(Some(TransferEvent::Data {
                token: request.token,
                bytes,
            })));
        }

        if self.rcv_filled > 0
            && now.elapsed_since(self.last_rx_millis) > RX_INTERBYTE_TIMEOUT_MS
        {
            debug!(
                received = self.rcv_filled,
                expected = self.rcv_expected,
                "inter-byte timeout"
            );
            self.fault_reset(now)?;
            return Ok(Step::Yield(None));
        }

        if now.elapsed_since(self.send_millis) > RX_TOTAL_TIMEOUT_MS {
            debug!(
                received = self.rcv_filled,
                expected = self.rcv_expected,
                waited_ms = now.elapsed_since(self.send_millis),
                "response timeout"
            );
            self.fault_reset(now)?;
        }
        Ok(Step::Yield(None))
    }
}

impl<L: SerialLink> Optolink for OptolinkGwg<L> {
    fn begin(&mut self, now: Millis) {
        self.state = GwgState::Init;
        self.last_millis = now;
        self.send_millis = Millis(0);
        self.last_rx_millis = Millis(0);
        self.burst_active = false;
        self.rcv_filled = 0;
        self.rcv_expected = 0;
    }

    fn poll(&mut self, now: Millis) -> Result<Option<TransferEvent>, OptolinkError> {
        let mut event = loop {
            let step = match self.state {
                GwgState::Undef => Step::Yield(None), // begin() not called
                GwgState::Init => self.init(now)?,
                GwgState::Idle => self.idle(now)?,
                GwgState::Send => self.send(now)?,
                GwgState::Receive => self.receive(now)?,
            };
            match step {
                Step::Continue => continue,
                Step::Yield(event) => break event,
            }
        };

        // Stale-queue watchdog: protects against deadlocks from lost sync.
        if event.is_none()
            && !self.queue.is_empty()
            && now.elapsed_since(self.last_millis) > STALE_QUEUE_TIMEOUT_MS
        {
            if let Some(request) = self.queue.pop_front() {
                warn!(address = request.address, "pending request timed out");
                event = Some(TransferEvent::Error {
                    token: request.token,
                    error: TransferError::Timeout,
                });
            }
            self.state = GwgState::Init;
            self.burst_active = false;
            self.rcv_filled = 0;
            self.link.discard_input()?;
            self.last_millis = now;
        }
        Ok(event)
    }

    fn enqueue_read(
        &mut self,
        address: u16,
        length: usize,
        token: Token,
    ) -> Result<(), OptolinkError> {
        self.queue.push_back(TransferRequest::read(address, length, token)?)
    }

    fn enqueue_write(
        &mut self,
        address: u16,
        data: &[u8],
        token: Token,
    ) -> Result<(), OptolinkError> {
        self.queue.push_back(TransferRequest::write(address, data, token)?)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
