// Byte-stream transports for TMCL modules
//
// A transport is owned by exactly one axis. It is reliable at the byte level
// but a read may come back short when the module does not answer in time.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use super::bus::BusError;

/// Default serial configuration for the scanner's TMCL modules
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_TIMEOUT_MS: u64 = 250;

/// A bidirectional byte stream to one TMCL module
pub trait Transport: Send {
    /// Write all of `bytes`, returning how many were written
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read up to `n` bytes, giving up after `timeout`.
    /// A result shorter than `n` means the module did not answer in time.
    fn read(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Drop any unread input (stale or partial replies)
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;
}

/// Opens transports from port identifiers
pub trait Connector: Send {
    fn open(&mut self, port: &str) -> Result<Box<dyn Transport>, BusError>;
}

/// Serial link to a TMCL module
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open a new connection to a module
    pub fn open(port_name: &str) -> Result<Self, BusError> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self, BusError> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        debug!("Opened serial port {} at {} baud", port_name, baudrate);
        Ok(Self {
            port: Some(port),
            name: port_name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "serial port already closed")
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(bytes.len())
    }

    fn read(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            port.set_timeout(remaining)?;
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }
}

/// Opens `SerialTransport`s at a fixed baudrate
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub baudrate: u32,
}

impl SerialConnector {
    pub fn new(baudrate: u32) -> Self {
        Self { baudrate }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BAUDRATE)
    }
}

impl Connector for SerialConnector {
    fn open(&mut self, port: &str) -> Result<Box<dyn Transport>, BusError> {
        Ok(Box::new(SerialTransport::open_with_baudrate(
            port,
            self.baudrate,
        )?))
    }
}
