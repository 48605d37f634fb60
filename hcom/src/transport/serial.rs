//! Serial port transport using the `serialport` crate.

use crate::error::TransportError;
use crate::transport::Transport;
use log::{debug, trace};
use serialport::ClearBuffer;
use std::io;
use std::time::Duration;

/// Serial port transport.
///
/// Read timeouts are short by design: the dispatch thread polls the
/// port under a shared lock, and writers must be able to interleave
/// between polls.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialTransport {
    /// Default per-read timeout.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

    /// Opens a serial port with the given parameters.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        Self::open_with_timeout(port_name, baud_rate, Self::DEFAULT_READ_TIMEOUT)
    }

    /// Opens a serial port with a custom per-read timeout.
    pub fn open_with_timeout(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: port_name.to_string(),
            baud_rate,
            read_timeout,
        })
    }

    /// Lists available serial ports.
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
        serialport::available_ports().map_err(TransportError::Serial)
    }

    /// Discards any buffered input and output.
    pub fn clear_buffers(&mut self) -> Result<(), TransportError> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(ref mut port) = self.port else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        };

        match port.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("read {n} bytes from {}", self.name);
                }
                Ok(n)
            },
            // A timed-out poll just means no frame arrived yet.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                debug!("hard read error on {}: {e}", self.name);
                self.port = None;
                Err(e)
            },
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some(ref mut port) = self.port else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        };

        trace!("writing {} bytes to {}", buf.len(), self.name);
        match port.write_all(buf).and_then(|()| port.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("hard write error on {}: {e}", self.name);
                self.port = None;
                Err(e)
            },
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn reopen(&mut self) -> io::Result<()> {
        // Drop the stale handle first; the OS device node may need it.
        self.port = None;

        let port = serialport::new(&self.name, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| io::Error::other(e.to_string()))?;

        self.port = Some(port);
        debug!("reopened {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
