//! P300 dialect engine
//!
//! The newest Vitotronic dialect. After a reset/handshake sequence the link
//! stays in a synchronized session: requests and responses travel in framed
//! telegrams with a start byte, a length byte and an additive checksum, and
//! every telegram is confirmed with ACK (0x06) or NACK (0x15).
//!
//! Handshake: send 0x04 (EOT) until the controller answers READY (0x05),
//! then open the session with `0x16 0x00 0x00`, confirmed by 0x06.
//!
//! Request telegram: `0x41 len 0x00 cmd addrHi addrLo dlen [payload] cksum`
//! where `cmd` is 0x01 for reads and 0x02 for writes, `len` counts the bytes
//! between the length byte and the checksum, and `cksum` is the sum of those
//! bytes plus the length byte, modulo 256. The response telegram mirrors the
//! request with 0x01 in place of 0x00 and carries the cell bytes for reads.

use tracing::{debug, warn};

use super::{
    Optolink, OptolinkError, RequestQueue, SerialLink, Step, Token, TransferError, TransferEvent,
    TransferRequest, MAX_DP_LENGTH, READY, STALE_QUEUE_TIMEOUT_MS,
};
use crate::time::Millis;

/// End-of-transmission byte, sent to force the controller out of any
/// previous session
const EOT: u8 = 0x04;

/// Telegram start byte
const FRAME_START: u8 = 0x41;

/// Positive acknowledgement
const FRAME_ACK: u8 = 0x06;

/// Negative acknowledgement
const FRAME_NACK: u8 = 0x15;

/// Session-open sequence following READY
const SESSION_OPEN: [u8; 3] = [0x16, 0x00, 0x00];

/// Resend the reset byte if the controller stays silent this long
const RESET_RETRY_MS: u32 = 500;

/// Handshake and telegram confirmation deadline
const ACK_TIMEOUT_MS: u32 = 1000;

/// A complete response telegram must arrive within this window
const RECEIVE_TIMEOUT_MS: u32 = 1000;

/// Re-open the session after this long without traffic, before the
/// controller silently drops it
const SESSION_KEEPALIVE_MS: u32 = 2000;

/// Largest possible response telegram: start, length and checksum bytes
/// around a 5-byte header and the cell payload
const FRAME_MAX: usize = 3 + 5 + MAX_DP_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum P300State {
    Undef,
    Reset,
    ResetAck,
    Init,
    InitAck,
    Idle,
    Send,
    SendAck,
    Receive,
}

/// P300 protocol engine.
pub struct OptolinkP300<L> {
    link: L,
    state: P300State,
    queue: RequestQueue,
    last_millis: Millis,
    send_millis: Millis,
    rcv_buffer: [u8; FRAME_MAX],
    rcv_filled: usize,
}

impl<L: SerialLink> OptolinkP300<L> {
    /// Create an engine over `link`. Call [`Optolink::begin`] before polling.
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: P300State::Undef,
            queue: RequestQueue::new(),
            last_millis: Millis(0),
            send_millis: Millis(0),
            rcv_buffer: [0; FRAME_MAX],
            rcv_filled: 0,
        }
    }

    /// Access the underlying serial link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Drop the session and start over from the reset handshake.
    fn fault_reset(&mut self, now: Millis) -> Result<(), OptolinkError> {
        self.rcv_filled = 0;
        self.state = P300State::Reset;
        self.link.discard_input()?;
        self.send_millis = now;
        Ok(())
    }

    fn reset(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        self.link.discard_input()?;
        self.link.write_all(&[EOT])?;
        self.send_millis = now;
        self.state = P300State::ResetAck;
        Ok(Step::Yield(None))
    }

    fn reset_ack(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if let Some(byte) = self.link.read_byte()? {
            if byte == READY {
                self.state = P300State::Init;
                return Ok(Step::Continue);
            }
            // Stale session byte, keep draining.
            return Ok(Step::Continue);
        }
        if now.elapsed_since(self.send_millis) > RESET_RETRY_MS {
            self.state = P300State::Reset;
            return Ok(Step::Continue);
        }
        Ok(Step::Yield(None))
    }

    fn init(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        self.link.write_all(&SESSION_OPEN)?;
        self.send_millis = now;
        self.state = P300State::InitAck;
        Ok(Step::Yield(None))
    }

    fn init_ack(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if let Some(byte) = self.link.read_byte()? {
            if byte == FRAME_ACK {
                debug!("P300 session established");
                self.last_millis = now;
                self.state = P300State::Idle;
            } else {
                debug!(byte, "unexpected byte during session open");
                self.state = P300State::Reset;
            }
            return Ok(Step::Continue);
        }
        if now.elapsed_since(self.send_millis) > ACK_TIMEOUT_MS {
            self.state = P300State::Reset;
            return Ok(Step::Continue);
        }
        Ok(Step::Yield(None))
    }

    fn idle(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if let Some(byte) = self.link.read_byte()? {
            debug!(byte, "received unexpected byte while idle");
            return Ok(Step::Yield(None));
        }
        if !self.queue.is_empty() {
            self.state = P300State::Send;
            return Ok(Step::Continue);
        }
        if now.elapsed_since(self.last_millis) > SESSION_KEEPALIVE_MS {
            // Refresh the session before the controller drops it.
            self.state = P300State::Init;
            return Ok(Step::Continue);
        }
        Ok(Step::Yield(None))
    }

    fn send(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        let Some(request) = self.queue.front() else {
            self.state = P300State::Idle;
            return Ok(Step::Yield(None));
        };

        let mut frame = [0u8; FRAME_MAX];
        let payload_len = 5 + if request.write { request.length } else { 0 };
        frame[0] = FRAME_START;
        frame[1] = payload_len as u8;
        frame[2] = 0x00; // request
        frame[3] = if request.write { 0x02 } else { 0x01 };
        frame[4] = (request.address >> 8) as u8;
        frame[5] = (request.address & 0xFF) as u8;
        frame[6] = request.length as u8;
        if request.write {
            frame[7..7 + request.length].copy_from_slice(&request.data);
        }
        let total = 2 + payload_len;
        frame[total] = checksum(&frame[1..total]);

        debug!(
            address = request.address,
            length = request.length,
            write = request.write,
            "sending P300 request"
        );
        self.link.write_all(&frame[..total + 1])?;

        self.rcv_filled = 0;
        self.send_millis = now;
        self.state = P300State::SendAck;
        Ok(Step::Yield(None))
    }

    fn send_ack(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if let Some(byte) = self.link.read_byte()? {
            return match byte {
                FRAME_ACK => {
                    self.send_millis = now;
                    self.state = P300State::Receive;
                    Ok(Step::Continue)
                }
                FRAME_NACK => {
                    let request = self
                        .queue
                        .pop_front()
                        .ok_or_else(|| OptolinkError::Link("ack without request".into()))?;
                    warn!(address = request.address, "request rejected by controller");
                    self.last_millis = now;
                    self.state = P300State::Idle;
                    Ok(Step::Yield(Some(TransferEvent::Error {
                        token: request.token,
                        error: TransferError::Nack,
                    })))
                }
                _ => {
                    debug!(byte, "unexpected byte instead of telegram ack");
                    self.fault_reset(now)?;
                    Ok(Step::Yield(None))
                }
            };
        }
        if now.elapsed_since(self.send_millis) > ACK_TIMEOUT_MS {
            self.fault_reset(now)?;
        }
        Ok(Step::Yield(None))
    }

    fn receive(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        while let Some(byte) = self.link.read_byte()? {
            if self.rcv_filled == 0 && byte != FRAME_START {
                debug!(byte, "response does not start a telegram");
                self.fault_reset(now)?;
                return Ok(Step::Yield(None));
            }
            if self.rcv_filled >= FRAME_MAX {
                warn!(filled = self.rcv_filled, "receive buffer overflow");
                self.fault_reset(now)?;
                return Ok(Step::Yield(None));
            }
            self.rcv_buffer[self.rcv_filled] = byte;
            self.rcv_filled += 1;
        }

        // Total length is known once the length byte has arrived.
        if self.rcv_filled >= 2 {
            let payload_len = self.rcv_buffer[1] as usize;
            if payload_len < 5 || 3 + payload_len > FRAME_MAX {
                warn!(payload_len, "impossible telegram length");
                return self.finish_response(now, Err(TransferError::Length));
            }
            if self.rcv_filled == 3 + payload_len {
                return self.complete_response(now, payload_len);
            }
        }

        if now.elapsed_since(self.send_millis) > RECEIVE_TIMEOUT_MS {
            debug!(received = self.rcv_filled, "response telegram timed out");
            self.fault_reset(now)?;
        }
        Ok(Step::Yield(None))
    }

    /// Validate a fully received telegram against the front request.
    fn complete_response(
        &mut self,
        now: Millis,
        payload_len: usize,
    ) -> Result<Step, OptolinkError> {
        let total = 3 + payload_len;
        let expected_cksum = checksum(&self.rcv_buffer[1..total - 1]);
        if self.rcv_buffer[total - 1] != expected_cksum {
            warn!(
                expected = expected_cksum,
                actual = self.rcv_buffer[total - 1],
                "telegram checksum mismatch"
            );
            self.link.write_all(&[FRAME_NACK])?;
            return self.finish_response(now, Err(TransferError::Crc));
        }

        let request = self
            .queue
            .front()
            .ok_or_else(|| OptolinkError::Link("response without request".into()))?;
        let address = u16::from_be_bytes([self.rcv_buffer[4], self.rcv_buffer[5]]);
        if self.rcv_buffer[2] != 0x01 || address != request.address {
            warn!(address, "telegram does not answer the pending request");
            self.link.write_all(&[FRAME_NACK])?;
            return self.finish_response(now, Err(TransferError::Crc));
        }
        let data_len = payload_len - 5;
        let expected_len = if request.write { 0 } else { request.length };
        if data_len != expected_len {
            warn!(
                data_len,
                expected = expected_len,
                "telegram data length does not match the request"
            );
            self.link.write_all(&[FRAME_NACK])?;
            return self.finish_response(now, Err(TransferError::Length));
        }

        self.link.write_all(&[FRAME_ACK])?;
        let bytes = if request.write {
            // Uniform write outcome across dialects: one accept byte.
            vec![0x00]
        } else {
            self.rcv_buffer[7..7 + payload_len - 5].to_vec()
        };
        debug!(
            address,
            length = bytes.len(),
            elapsed_ms = now.elapsed_since(self.send_millis),
            "P300 transfer complete"
        );
        self.finish_response(now, Ok(bytes))
    }

    /// Pop the front request, deliver its outcome and return to IDLE.
    fn finish_response(
        &mut self,
        now: Millis,
        outcome: Result<Vec<u8>, TransferError>,
    ) -> Result<Step, OptolinkError> {
        let request = self
            .queue
            .pop_front()
            .ok_or_else(|| OptolinkError::Link("response without request".into()))?;
        self.rcv_filled = 0;
        self.last_millis = now;
        self.state = P300State::Idle;
        let event = match outcome {
            Ok(bytes) => TransferEvent::Data {
                token: request.token,
                bytes,
            },
            Err(error) => TransferEvent::Error {
                token: request.token,
                error,
            },
        };
        Ok(Step::Yield(Some(event)))
    }
}

/// Additive telegram checksum: sum of all bytes between the start byte and
/// the checksum itself, modulo 256.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl<L: SerialLink> Optolink for OptolinkP300<L> {
    fn begin(&mut self, now: Millis) {
        self.state = P300State::Reset;
        self.last_millis = now;
        self.send_millis = now;
        self.rcv_filled = 0;
    }

    fn poll(&mut self, now: Millis) -> Result<Option<TransferEvent>, OptolinkError> {
        let mut event = loop {
            let step = match self.state {
                P300State::Undef => Step::Yield(None), // begin() not called
                P300State::Reset => self.reset(now)?,
                P300State::ResetAck => self.reset_ack(now)?,
                P300State::Init => self.init(now)?,
                P300State::InitAck => self.init_ack(now)?,
                P300State::Idle => self.idle(now)?,
                P300State::Send => self.send(now)?,
                P300State::SendAck => self.send_ack(now)?,
                P300State::Receive => self.receive(now)?,
            };
            match step {
                Step::Continue => continue,
                Step::Yield(event) => break event,
            }
        };

        // Stale-queue watchdog, shared across all dialects.
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
            self.state = P300State::Reset;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optolink::mock::{init_tracing, MockLink};
    use pretty_assertions::assert_eq;

    fn engine() -> OptolinkP300<MockLink> {
        init_tracing();
        let mut engine = OptolinkP300::new(MockLink::new());
        engine.begin(Millis(0));
        engine
    }

    /// Run the reset/init handshake to an established session.
    fn establish(engine: &mut OptolinkP300<MockLink>) {
        engine.poll(Millis(0)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), vec![EOT]);
        engine.link_mut().feed(&[READY]);
        engine.poll(Millis(10)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), SESSION_OPEN.to_vec());
        engine.link_mut().feed(&[FRAME_ACK]);
        engine.poll(Millis(20)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), Vec::<u8>::new());
    }

    /// Build a framed telegram with a valid checksum.
    fn telegram(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_START, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame[1..]));
        frame
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[0x05, 0x00, 0x01, 0x55, 0x25, 0x02]), 0x82);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01); // wraps
    }

    #[test]
    fn test_read_roundtrip() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_read(0x5525, 2, 5).unwrap();

        engine.poll(Millis(30)).unwrap();
        let expected = {
            let mut frame = vec![FRAME_START, 0x05, 0x00, 0x01, 0x55, 0x25, 0x02];
            frame.push(checksum(&frame[1..]));
            frame
        };
        assert_eq!(engine.link_mut().take_tx(), expected);

        // Controller confirms, then answers with a framed telegram.
        engine.link_mut().feed(&[FRAME_ACK]);
        engine
            .link_mut()
            .feed(&telegram(&[0x01, 0x01, 0x55, 0x25, 0x02, 0x07, 0x01]));
        let event = engine.poll(Millis(40)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Data {
                token: 5,
                bytes: vec![0x07, 0x01],
            })
        );
        // The response telegram was acknowledged.
        assert_eq!(engine.link_mut().take_tx(), vec![FRAME_ACK]);
    }

    #[test]
    fn test_write_roundtrip() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_write(0x2323, &[0x2A], 9).unwrap();

        engine.poll(Millis(30)).unwrap();
        let expected = {
            let mut frame = vec![FRAME_START, 0x06, 0x00, 0x02, 0x23, 0x23, 0x01, 0x2A];
            frame.push(checksum(&frame[1..]));
            frame
        };
        assert_eq!(engine.link_mut().take_tx(), expected);

        engine.link_mut().feed(&[FRAME_ACK]);
        engine
            .link_mut()
            .feed(&telegram(&[0x01, 0x02, 0x23, 0x23, 0x01]));
        let event = engine.poll(Millis(40)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Data {
                token: 9,
                bytes: vec![0x00],
            })
        );
    }

    #[test]
    fn test_nack_surfaces_error() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_read(0x5525, 2, 3).unwrap();
        engine.poll(Millis(30)).unwrap();
        engine.link_mut().take_tx();

        engine.link_mut().feed(&[FRAME_NACK]);
        let event = engine.poll(Millis(40)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Error {
                token: 3,
                error: TransferError::Nack,
            })
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_bad_checksum_surfaces_crc_error() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_read(0x5525, 1, 4).unwrap();
        engine.poll(Millis(30)).unwrap();
        engine.link_mut().take_tx();

        engine.link_mut().feed(&[FRAME_ACK]);
        let mut frame = telegram(&[0x01, 0x01, 0x55, 0x25, 0x01, 0x42]);
        *frame.last_mut().unwrap() ^= 0xFF;
        engine.link_mut().feed(&frame);
        let event = engine.poll(Millis(40)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Error {
                token: 4,
                error: TransferError::Crc,
            })
        );
        // The corrupt telegram was NACKed.
        assert_eq!(engine.link_mut().take_tx(), vec![FRAME_NACK]);
    }

    #[test]
    fn test_short_read_response_surfaces_length_error() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_read(0x5525, 2, 6).unwrap();
        engine.poll(Millis(30)).unwrap();
        engine.link_mut().take_tx();

        // Validly checksummed response carrying one data byte instead of two.
        engine.link_mut().feed(&[FRAME_ACK]);
        engine
            .link_mut()
            .feed(&telegram(&[0x01, 0x01, 0x55, 0x25, 0x01, 0x42]));
        let event = engine.poll(Millis(40)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Error {
                token: 6,
                error: TransferError::Length,
            })
        );
        assert_eq!(engine.link_mut().take_tx(), vec![FRAME_NACK]);
    }

    #[test]
    fn test_reset_retries_until_ready() {
        let mut engine = engine();
        engine.poll(Millis(0)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), vec![EOT]);

        // Silence: the reset byte is resent after the retry interval.
        engine.poll(Millis(501)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), vec![EOT]);
    }

    #[test]
    fn test_watchdog_escalates_timeout() {
        let mut engine = engine();
        establish(&mut engine);
        engine.enqueue_read(0x5525, 2, 7).unwrap();
        engine.poll(Millis(30)).unwrap();
        engine.link_mut().take_tx();

        // The controller never confirms; per-step resets keep retrying until
        // the stale-queue watchdog escalates.
        let mut event = None;
        for t in (100..7000).step_by(100) {
            event = engine.poll(Millis(t)).unwrap();
            if event.is_some() {
                break;
            }
            engine.link_mut().take_tx();
        }
        assert_eq!(
            event,
            Some(TransferEvent::Error {
                token: 7,
                error: TransferError::Timeout,
            })
        );
    }
}
