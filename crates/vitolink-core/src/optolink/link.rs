//! Serial link access
//!
//! The engines talk to the controller through the [`SerialLink`] capability:
//! a byte-oriented, strictly non-blocking view of the wire. The host supplies
//! an implementation; [`SerialPortLink`] adapts a [`serialport`] handle using
//! `bytes_to_read()` polling so no call ever blocks waiting for data.

use serialport::SerialPort;
use std::io::Read;
use std::time::Duration;

use super::OptolinkError;

/// Default baud rate of the Optolink interface
pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Non-blocking byte-oriented access to the half-duplex serial wire.
///
/// Every method must return promptly. "No byte available" is a normal
/// outcome (`Ok(None)` / `Ok(0)`), not an error.
pub trait SerialLink {
    /// Number of received bytes ready to be read.
    fn available(&mut self) -> Result<usize, OptolinkError>;

    /// Look at the next received byte without consuming it.
    fn peek(&mut self) -> Result<Option<u8>, OptolinkError>;

    /// Consume and return the next received byte, if any.
    fn read_byte(&mut self) -> Result<Option<u8>, OptolinkError>;

    /// Queue `data` for transmission.
    fn write_all(&mut self, data: &[u8]) -> Result<(), OptolinkError>;

    /// Drop all received bytes that have not been read yet.
    fn discard_input(&mut self) -> Result<(), OptolinkError>;
}

/// [`SerialLink`] adapter over a host serial port.
///
/// Keeps a one-byte lookahead so `peek()` works on top of the stream-only
/// serial port API.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    lookahead: Option<u8>,
}

impl SerialPortLink {
    /// Wrap an already opened and configured serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            lookahead: None,
        }
    }

    fn fill_lookahead(&mut self) -> Result<(), OptolinkError> {
        if self.lookahead.is_some() {
            return Ok(());
        }
        let pending = self
            .port
            .bytes_to_read()
            .map_err(|e| OptolinkError::Link(e.to_string()))?;
        if pending == 0 {
            return Ok(());
        }
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => {
                self.lookahead = Some(buf[0]);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => Err(OptolinkError::Link(e.to_string())),
        }
    }
}

impl SerialLink for SerialPortLink {
    fn available(&mut self) -> Result<usize, OptolinkError> {
        let pending = self
            .port
            .bytes_to_read()
            .map_err(|e| OptolinkError::Link(e.to_string()))? as usize;
        Ok(pending + usize::from(self.lookahead.is_some()))
    }

    fn peek(&mut self) -> Result<Option<u8>, OptolinkError> {
        self.fill_lookahead()?;
        Ok(self.lookahead)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, OptolinkError> {
        self.fill_lookahead()?;
        Ok(self.lookahead.take())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), OptolinkError> {
        self.port
            .write_all(data)
            .map_err(|e| OptolinkError::Link(e.to_string()))
    }

    fn discard_input(&mut self) -> Result<(), OptolinkError> {
        self.lookahead = None;
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| OptolinkError::Link(e.to_string()))
    }
}

/// Open a serial port with the Optolink line settings (4800 baud, 8E2).
///
/// The short port timeout only bounds the rare `read()` that races a
/// disappearing byte; all reads are gated on `bytes_to_read()`.
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<SerialPortLink, OptolinkError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    let mut port = serialport::new(name, baud)
        .timeout(Duration::from_millis(10))
        .open()
        .map_err(|e| OptolinkError::Link(e.to_string()))?;

    configure_port(port.as_mut())?;
    Ok(SerialPortLink::new(port))
}

/// Configure a serial port for Optolink communication: 8 data bits, even
/// parity, 2 stop bits, as required by the Vitotronic line discipline.
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), OptolinkError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| OptolinkError::Link(e.to_string()))?;
    port.set_parity(serialport::Parity::Even)
        .map_err(|e| OptolinkError::Link(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::Two)
        .map_err(|e| OptolinkError::Link(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| OptolinkError::Link(e.to_string()))?;
    Ok(())
}
