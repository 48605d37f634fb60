//! Transport abstraction for the HCOM byte stream.
//!
//! The protocol layers are written against the [`Transport`] trait so
//! they run unchanged over a serial port, a socket, or a scripted test
//! double. The contract the core relies on:
//!
//! - `read` blocks briefly and returns `Ok(0)` when no data arrived yet
//!   ("no data" is not end-of-stream); a hard disconnect is an `Err` or
//!   `is_open()` turning false.
//! - the stream is reliable and ordered (serial/USB-CDC semantics); the
//!   core layers only application-level acknowledgement on top.
//! - each successful `read` yields at most one complete frame.

#[cfg(feature = "native")]
pub mod serial;

use crate::error::TransportError;
use log::{debug, warn};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Duplex byte channel the core reads from and writes to.
pub trait Transport: Send {
    /// Reads available bytes into `buf`, returning the count.
    ///
    /// `Ok(0)` means no data arrived within the transport's internal
    /// timeout; callers retry rather than treating it as end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf`, blocking until complete.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Whether the channel is currently usable.
    fn is_open(&self) -> bool;

    /// Attempts to re-establish the channel after a disconnect.
    fn reopen(&mut self) -> io::Result<()>;

    /// Human-readable name for log output.
    fn name(&self) -> &str {
        "transport"
    }
}

/// Transport shared between the dispatch thread and command callers.
///
/// Readers hold the lock only for one short-timeout `read` at a time,
/// so writers interleave between polls.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Bounded reconnect loop: polls `reopen` until the transport is open.
///
/// Fails with [`TransportError::NotConnected`] once `max_attempts`
/// polls spaced `interval` apart have been exhausted.
pub fn reconnect(
    transport: &SharedTransport,
    interval: Duration,
    max_attempts: usize,
) -> Result<(), TransportError> {
    for attempt in 1..=max_attempts {
        {
            let mut t = transport
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if t.is_open() {
                return Ok(());
            }
            match t.reopen() {
                Ok(()) if t.is_open() => {
                    debug!("transport {} reopened on attempt {attempt}", t.name());
                    return Ok(());
                },
                Ok(()) => {},
                Err(e) => {
                    debug!("reopen attempt {attempt}/{max_attempts} failed: {e}");
                },
            }
        }

        if attempt < max_attempts {
            thread::sleep(interval);
        }
    }

    warn!("transport did not come back after {max_attempts} attempts");
    Err(TransportError::NotConnected(max_attempts))
}
