//! Shared write side of an HCOM connection.
//!
//! A [`Link`] owns the frame codec, the outbound sequence counter and
//! the shared transport handle. All configuration is threaded through
//! [`LinkConfig`]; nothing protocol-related lives in global state.
//!
//! The write side is not exclusive-locked across whole operations: the
//! protocol has no multiplexing beyond the 16-bit sequence field, so
//! callers are expected to finish one send (including a chunked file
//! payload) before issuing another.

use crate::error::{SendError, TransportError};
use crate::protocol::codes::RequestCode;
use crate::protocol::frame::{FrameCodec, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use crate::transport::{self, SharedTransport, Transport};
use log::trace;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tunable parameters of an HCOM link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Protocol version stamped into every outbound header.
    pub protocol_version: u16,
    /// Maximum total frame size in bytes.
    pub max_packet_size: usize,
    /// Timeout for an ordinary command reply.
    pub command_timeout: Duration,
    /// Timeout for a file-start acknowledgement.
    pub file_ack_timeout: Duration,
    /// Timeout for a terminal `Concluded` after a long operation.
    pub conclude_timeout: Duration,
    /// Settle delay after a reset or mode toggle before reconnecting.
    pub settle_delay: Duration,
    /// Interval between device-readiness polls.
    pub ready_poll_interval: Duration,
    /// Wall-clock budget for a reset/readiness cycle.
    pub ready_deadline: Duration,
    /// Interval between transport reconnect attempts.
    pub reconnect_interval: Duration,
    /// Maximum transport reconnect attempts before `NotConnected`.
    pub reconnect_attempts: usize,
    /// Wall-clock budget for the run-mode toggle loop.
    pub mode_toggle_deadline: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            max_packet_size: MAX_PACKET_SIZE,
            command_timeout: Duration::from_secs(2),
            file_ack_timeout: Duration::from_secs(5),
            conclude_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            ready_poll_interval: Duration::from_millis(500),
            ready_deadline: Duration::from_secs(30),
            reconnect_interval: Duration::from_millis(500),
            reconnect_attempts: 20,
            mode_toggle_deadline: Duration::from_secs(60),
        }
    }
}

impl LinkConfig {
    /// Sets the protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the ordinary command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the run-mode toggle deadline.
    #[must_use]
    pub fn with_mode_toggle_deadline(mut self, deadline: Duration) -> Self {
        self.mode_toggle_deadline = deadline;
        self
    }
}

/// Write side of an HCOM connection.
pub struct Link {
    transport: SharedTransport,
    codec: FrameCodec,
    sequence: AtomicU16,
    config: LinkConfig,
}

impl Link {
    /// Wraps a transport in a link with the given configuration.
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        let codec = FrameCodec::new(config.protocol_version, config.max_packet_size);
        Self {
            transport: Arc::new(Mutex::new(transport)),
            codec,
            sequence: AtomicU16::new(0),
            config,
        }
    }

    /// Returns the link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Returns the shared transport handle (for the dispatch thread).
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Returns the largest file chunk one frame may carry.
    pub fn max_chunk_size(&self) -> usize {
        self.codec.max_chunk_size()
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Encodes a Simple frame with the next sequence number.
    pub fn encode_simple(&self, code: RequestCode, user_data: u32) -> Vec<u8> {
        self.codec
            .encode_simple(self.next_sequence(), code.code(), user_data)
    }

    /// Encodes a FileStart frame with the next sequence number.
    pub fn encode_file_start(
        &self,
        code: RequestCode,
        partition: u32,
        file_size: u32,
        checksum: u32,
        file_name: &str,
        mcu_addr: u16,
    ) -> Vec<u8> {
        self.codec.encode_file_start(
            self.next_sequence(),
            code.code(),
            partition,
            file_size,
            checksum,
            file_name,
            mcu_addr,
        )
    }

    /// Encodes a SimpleBinary frame with the next sequence number.
    pub fn encode_binary(
        &self,
        code: RequestCode,
        user_data: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, SendError> {
        Ok(self
            .codec
            .encode_binary(self.next_sequence(), code.code(), user_data, payload)?)
    }

    /// Writes a pre-encoded frame to the transport.
    pub fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut t = self
            .transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        trace!("sending {} byte frame", frame.len());
        t.write_all(frame)?;
        Ok(())
    }

    /// Encodes and sends a Simple frame in one step.
    pub fn send_simple(&self, code: RequestCode, user_data: u32) -> Result<(), TransportError> {
        let frame = self.encode_simple(code, user_data);
        self.send_raw(&frame)
    }

    /// Runs the bounded reconnect loop on the underlying transport.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        transport::reconnect(
            &self.transport,
            self.config.reconnect_interval,
            self.config.reconnect_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameCodec;
    use std::io;

    struct SinkTransport {
        written: Vec<Vec<u8>>,
    }

    impl Transport for SinkTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.push(buf.to_vec());
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn reopen(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let link = Link::new(
            Box::new(SinkTransport { written: Vec::new() }),
            LinkConfig::default(),
        );

        let a = link.encode_simple(RequestCode::Reset, 0);
        let b = link.encode_simple(RequestCode::Reset, 0);

        let (ha, _) = FrameCodec::decode(&a).unwrap();
        let (hb, _) = FrameCodec::decode(&b).unwrap();
        assert_eq!(hb.sequence, ha.sequence.wrapping_add(1));
    }

    #[test]
    fn test_config_version_reaches_wire() {
        let link = Link::new(
            Box::new(SinkTransport { written: Vec::new() }),
            LinkConfig::default().with_protocol_version(7),
        );

        let frame = link.encode_simple(RequestCode::GetDeviceInfo, 0);
        let (header, _) = FrameCodec::decode(&frame).unwrap();
        assert_eq!(header.version, 7);
    }
}
