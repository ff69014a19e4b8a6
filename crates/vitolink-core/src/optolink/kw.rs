//! KW dialect engine
//!
//! The oldest Vitotronic dialect. The controller periodically emits a READY
//! byte (`0x05`); a request may only follow directly after one, opened by a
//! single `0x01` sync byte. Frames are unchecked byte sequences:
//! `0xF7 addrHi addrLo len` for reads, `0xF4 addrHi addrLo len payload` for
//! writes answered by a single acknowledgement byte.

use tracing::{debug, warn};

use super::{
    Optolink, OptolinkError, RequestQueue, SerialLink, Step, Token, TransferError, TransferEvent,
    TransferRequest, ACK, MAX_DP_LENGTH, READY, STALE_QUEUE_TIMEOUT_MS,
};
use crate::time::Millis;

/// Reset probe sent while unsynchronized, in case the controller is stuck in
/// a P300 session (0x04 is the P300 end-of-transmission byte).
const RESET_PROBE: u8 = 0x04;

/// Probe interval while waiting for the first READY byte
const PROBE_INTERVAL_MS: u32 = 1000;

/// Window after a completed transfer in which the next request may be sent
/// without waiting for another READY byte
const FAST_SEND_WINDOW_MS: u32 = 10;

/// Without a READY byte for this long, fall back to INIT
const IDLE_TIMEOUT_MS: u32 = 5000;

/// A partial response older than this is abandoned
const RECEIVE_TIMEOUT_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KwState {
    Undef,
    Init,
    Idle,
    Sync,
    Send,
    Receive,
}

/// KW protocol engine.
pub struct OptolinkKw<L> {
    link: L,
    state: KwState,
    queue: RequestQueue,
    last_millis: Millis,
    probe_millis: Millis,
    rcv_buffer: [u8; MAX_DP_LENGTH],
    rcv_filled: usize,
    rcv_expected: usize,
}

impl<L: SerialLink> OptolinkKw<L> {
    /// Create an engine over `link`. Call [`Optolink::begin`] before polling.
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: KwState::Undef,
            queue: RequestQueue::new(),
            last_millis: Millis(0),
            probe_millis: Millis(0),
            rcv_buffer: [0; MAX_DP_LENGTH],
            rcv_filled: 0,
            rcv_expected: 0,
        }
    }

    /// Access the underlying serial link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn init(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if self.link.available()? > 0 {
            if self.link.peek()? == Some(READY) {
                // Leave the READY byte in place so IDLE consumes it this tick.
                self.state = KwState::Idle;
                return Ok(Step::Continue);
            }
            self.link.read_byte()?;
            return Ok(Step::Continue);
        }
        if now.elapsed_since(self.probe_millis) > PROBE_INTERVAL_MS {
            self.probe_millis = now;
            self.link.write_all(&[RESET_PROBE])?;
        }
        Ok(Step::Yield(None))
    }

    fn idle(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        if self.link.available()? > 0 {
            if self.link.read_byte()? == Some(READY) {
                self.last_millis = now;
                if !self.queue.is_empty() {
                    self.state = KwState::Sync;
                    return Ok(Step::Continue);
                }
            } else {
                debug!("received unexpected data while idle");
            }
        } else if !self.queue.is_empty()
            && now.elapsed_since(self.last_millis) < FAST_SEND_WINDOW_MS
        {
            // Directly after a completed transfer the controller accepts the
            // next request without a new READY byte.
            self.state = KwState::Send;
            return Ok(Step::Continue);
        } else if now.elapsed_since(self.last_millis) > IDLE_TIMEOUT_MS {
            self.state = KwState::Init;
        }
        Ok(Step::Yield(None))
    }

    fn sync(&mut self) -> Result<Step, OptolinkError> {
        self.link.write_all(&[ACK])?;
        self.state = KwState::Send;
        Ok(Step::Continue)
    }

    fn send(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        let Some(request) = self.queue.front() else {
            self.state = KwState::Idle;
            return Ok(Step::Yield(None));
        };

        let mut frame = [0u8; MAX_DP_LENGTH + 4];
        frame[1] = (request.address >> 8) as u8;
        frame[2] = (request.address & 0xFF) as u8;
        frame[3] = request.length as u8;
        let frame_len = if request.write {
            frame[0] = 0xF4;
            frame[4..4 + request.length].copy_from_slice(&request.data);
            // Only a single acknowledgement byte comes back for writes.
            self.rcv_expected = 1;
            4 + request.length
        } else {
            frame[0] = 0xF7;
            self.rcv_expected = request.length;
            4
        };
        debug!(
            address = request.address,
            length = request.length,
            write = request.write,
            "sending KW request"
        );
        self.link.write_all(&frame[..frame_len])?;

        self.rcv_filled = 0;
        self.last_millis = now;
        self.state = KwState::Receive;
        Ok(Step::Yield(None))
    }

    fn receive(&mut self, now: Millis) -> Result<Step, OptolinkError> {
        while self.link.available()? > 0 {
            let Some(byte) = self.link.read_byte()? else {
                break;
            };
            if self.rcv_filled >= MAX_DP_LENGTH {
                warn!(filled = self.rcv_filled, "receive buffer overflow");
                self.rcv_filled = 0;
                self.state = KwState::Init;
                self.link.discard_input()?;
                return Ok(Step::Yield(None));
            }
            self.rcv_buffer[self.rcv_filled] = byte;
            self.rcv_filled += 1;
            self.last_millis = now;
        }

        if self.rcv_filled == self.rcv_expected {
            // pop-on-success: exactly this entry is consumed for this event
            let request = self
                .queue
                .pop_front()
                .ok_or_else(|| OptolinkError::Link("receive without request".into()))?;
            debug!(
                address = request.address,
                length = self.rcv_filled,
                "KW transfer complete"
            );
            let bytes = self.rcv_buffer[..self.rcv_filled].to_vec();
            self.state = KwState::Idle;
            self.last_millis = now;
            return Ok(Step::Yield(Some(TransferEvent::Data {
                token: request.token,
                bytes,
            })));
        }

        if now.elapsed_since(self.last_millis) > RECEIVE_TIMEOUT_MS {
            debug!(
                received = self.rcv_filled,
                expected = self.rcv_expected,
                "KW response incomplete, resynchronizing"
            );
            self.rcv_filled = 0;
            self.state = KwState::Init;
        }
        Ok(Step::Yield(None))
    }
}

impl<L: SerialLink> Optolink for OptolinkKw<L> {
    fn begin(&mut self, now: Millis) {
        self.state = KwState::Init;
        self.last_millis = now;
        self.probe_millis = now;
        self.rcv_filled = 0;
        self.rcv_expected = 0;
    }

    fn poll(&mut self, now: Millis) -> Result<Option<TransferEvent>, OptolinkError> {
        let mut event = loop {
            let step = match self.state {
                KwState::Undef => Step::Yield(None), // begin() not called
                KwState::Init => self.init(now)?,
                KwState::Idle => self.idle(now)?,
                KwState::Sync => self.sync()?,
                KwState::Send => self.send(now)?,
                KwState::Receive => self.receive(now)?,
            };
            match step {
                Step::Continue => continue,
                Step::Yield(event) => break event,
            }
        };

        // Stale-queue watchdog: no request completed although some are pending.
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
            self.state = KwState::Init;
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

    fn engine() -> OptolinkKw<MockLink> {
        init_tracing();
        let mut engine = OptolinkKw::new(MockLink::new());
        engine.begin(Millis(0));
        engine
    }

    #[test]
    fn test_read_roundtrip() {
        let mut engine = engine();
        engine.enqueue_read(0x1234, 2, 7).unwrap();

        // READY arrives: INIT peeks it, IDLE consumes it, SYNC acks and the
        // request frame goes out in the same tick.
        engine.link_mut().feed(&[READY]);
        assert_eq!(engine.poll(Millis(100)).unwrap(), None);
        assert_eq!(
            engine.link_mut().take_tx(),
            vec![ACK, 0xF7, 0x12, 0x34, 0x02]
        );

        // Response arrives split across two ticks.
        engine.link_mut().feed(&[0xA0]);
        assert_eq!(engine.poll(Millis(110)).unwrap(), None);
        engine.link_mut().feed(&[0x01]);
        let event = engine.poll(Millis(120)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Data {
                token: 7,
                bytes: vec![0xA0, 0x01],
            })
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_write_expects_single_ack_byte() {
        let mut engine = engine();
        engine.enqueue_write(0x2301, &[0x64], 1).unwrap();

        engine.link_mut().feed(&[READY]);
        engine.poll(Millis(50)).unwrap();
        assert_eq!(
            engine.link_mut().take_tx(),
            vec![ACK, 0xF4, 0x23, 0x01, 0x01, 0x64]
        );

        engine.link_mut().feed(&[0x00]);
        let event = engine.poll(Millis(60)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Data {
                token: 1,
                bytes: vec![0x00],
            })
        );
    }

    #[test]
    fn test_fast_consecutive_send_skips_ready() {
        let mut engine = engine();
        engine.enqueue_read(0x1000, 1, 1).unwrap();
        engine.enqueue_read(0x2000, 1, 2).unwrap();

        engine.link_mut().feed(&[READY]);
        engine.poll(Millis(100)).unwrap();
        engine.link_mut().take_tx();
        engine.link_mut().feed(&[0x42]);
        assert!(engine.poll(Millis(105)).unwrap().is_some());

        // Second request goes out within the fast-send window, without a new
        // READY and without a sync byte.
        assert_eq!(engine.poll(Millis(108)).unwrap(), None);
        assert_eq!(engine.link_mut().take_tx(), vec![0xF7, 0x20, 0x00, 0x01]);
    }

    #[test]
    fn test_init_sends_probe_every_second() {
        let mut engine = engine();
        assert_eq!(engine.poll(Millis(500)).unwrap(), None);
        assert_eq!(engine.link_mut().take_tx(), Vec::<u8>::new());

        engine.poll(Millis(1500)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), vec![RESET_PROBE]);

        // Not again before the probe interval elapses.
        engine.poll(Millis(1600)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), Vec::<u8>::new());
    }

    #[test]
    fn test_init_discards_garbage_until_ready() {
        let mut engine = engine();
        engine.enqueue_read(0x1234, 1, 3).unwrap();
        engine.link_mut().feed(&[0xAA, 0xBB, READY]);
        engine.poll(Millis(10)).unwrap();
        // Garbage consumed, READY consumed by IDLE, request sent.
        assert_eq!(
            engine.link_mut().take_tx(),
            vec![ACK, 0xF7, 0x12, 0x34, 0x01]
        );
    }

    #[test]
    fn test_receive_timeout_resynchronizes() {
        let mut engine = engine();
        engine.enqueue_read(0x1234, 2, 4).unwrap();
        engine.link_mut().feed(&[READY]);
        engine.poll(Millis(0)).unwrap();
        engine.link_mut().take_tx();

        // Only half the response, then silence past the receive timeout.
        engine.link_mut().feed(&[0xA0]);
        engine.poll(Millis(10)).unwrap();
        assert_eq!(engine.poll(Millis(1100)).unwrap(), None);

        // Engine is back probing for sync; the request is still queued.
        assert_eq!(engine.pending(), 1);
        engine.poll(Millis(2200)).unwrap();
        assert_eq!(engine.link_mut().take_tx(), vec![RESET_PROBE]);
    }

    #[test]
    fn test_watchdog_reports_timeout_and_pops_front() {
        let mut engine = engine();
        engine.enqueue_read(0x1234, 2, 9).unwrap();
        engine.poll(Millis(0)).unwrap();

        let event = engine.poll(Millis(5001)).unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Error {
                token: 9,
                error: TransferError::Timeout,
            })
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_no_ack_without_ready() {
        let mut engine = engine();
        engine.enqueue_read(0x1234, 1, 1).unwrap();
        // Plenty of ticks with no READY byte: nothing but reset probes may
        // be transmitted.
        for t in (0..4000).step_by(100) {
            engine.poll(Millis(t)).unwrap();
        }
        let tx = engine.link_mut().take_tx();
        assert!(tx.iter().all(|&b| b == RESET_PROBE));
    }
}
