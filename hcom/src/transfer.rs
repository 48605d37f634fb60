//! File transfer engine: push a payload to the device in chunks.
//!
//! A transfer is FileStart, then the payload as SimpleBinary chunks
//! carrying their byte offset in `user_data`, then (for the last file
//! of a batch) a ConcludeTransfer frame. The device acknowledges the
//! FileStart before any chunk is sent and confirms the whole operation
//! with a terminal `Concluded`.
//!
//! Integrity is layered: a CRC32 of the whole payload rides in the
//! FileStart header, and for transfers relayed to a secondary MCU an
//! MD5 digest is appended to the wire filename so the relaying firmware
//! can verify what it forwards.

use crate::coordinator::{CancelToken, Coordinator};
use crate::error::TransferError;
use crate::link::Link;
use crate::protocol::codes::{ReplyKind, RequestCode};
use crate::protocol::message::DeviceMessage;
use log::{debug, info};
use md5::{Digest, Md5};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes written to the wire (chunks only, no headers).
    pub bytes_sent: usize,
    /// Number of chunk frames sent.
    pub chunk_count: usize,
    /// CRC32 of the payload, as carried in the FileStart frame.
    pub crc32: u32,
    /// Wall-clock duration from FileStart to the terminal conclusion.
    pub elapsed: Duration,
}

/// Pushes file payloads to the device.
#[derive(Clone)]
pub struct FileTransferEngine {
    link: Arc<Link>,
    coordinator: Coordinator,
}

impl FileTransferEngine {
    /// Creates an engine over a link and its coordinator.
    pub fn new(link: Arc<Link>, coordinator: Coordinator) -> Self {
        Self { link, coordinator }
    }

    /// Sends one file payload to the device.
    ///
    /// `mcu_addr` of zero targets the primary MCU; any other value makes
    /// the device relay the file, and an MD5 digest is appended to the
    /// wire filename for end-to-end verification. `last_in_series`
    /// controls whether a ConcludeTransfer frame follows the chunks;
    /// pass `false` for every file of a batch except the final one.
    pub fn send_file(
        &self,
        code: RequestCode,
        file_name: &str,
        partition: u32,
        payload: &[u8],
        mcu_addr: u16,
        last_in_series: bool,
        cancel: &CancelToken,
    ) -> Result<TransferStats, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::SourceUnavailable);
        }

        let crc32 = crc32fast::hash(payload);
        let wire_name = wire_file_name(file_name, payload, mcu_addr);
        let config = self.link.config();
        let started = Instant::now();

        debug!(
            "starting transfer of {file_name} ({} bytes, crc {crc32:#010x}, mcu {mcu_addr})",
            payload.len()
        );

        #[allow(clippy::cast_possible_truncation)]
        let start = self.link.encode_file_start(
            code,
            partition,
            payload.len() as u32,
            crc32,
            &wire_name,
            mcu_addr,
        );
        let ack = self.coordinator.send_and_await(
            &start,
            |m| matches!(m, DeviceMessage::FileAck { .. }),
            config.file_ack_timeout,
            cancel,
        )?;
        if ack.kind() == ReplyKind::FileStartFail {
            return Err(TransferError::Rejected);
        }

        // The conclusion slot must exist before the final chunk goes
        // out, or a fast device could conclude into the void.
        let (_guard, rx) = self
            .coordinator
            .register(|m| m.kind() == ReplyKind::Concluded);

        let mut chunk_count = 0;
        for (index, chunk) in payload.chunks(self.link.max_chunk_size()).enumerate() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            #[allow(clippy::cast_possible_truncation)]
            let offset = (index * self.link.max_chunk_size()) as u32;
            let frame = self.link.encode_binary(code, offset, chunk)?;
            self.link.send_raw(&frame)?;
            chunk_count += 1;
        }

        if last_in_series {
            self.link.send_simple(RequestCode::ConcludeTransfer, 0)?;
        }

        Coordinator::wait_on(&rx, config.conclude_timeout, cancel)?;
        let elapsed = started.elapsed();

        info!(
            "transferred {file_name}: {} bytes in {chunk_count} chunks, {elapsed:?}",
            payload.len()
        );

        Ok(TransferStats {
            bytes_sent: payload.len(),
            chunk_count,
            crc32,
            elapsed,
        })
    }

    /// Deletes a file on the device.
    ///
    /// Encoded as a FileStart frame carrying only the name; size,
    /// checksum and partition are zero.
    pub fn delete_file(&self, file_name: &str, cancel: &CancelToken) -> Result<(), TransferError> {
        let frame = self
            .link
            .encode_file_start(RequestCode::DeleteFile, 0, 0, 0, file_name, 0);

        let reply = self.coordinator.send_and_await(
            &frame,
            |m| {
                m.kind() == ReplyKind::Concluded
                    || matches!(
                        m,
                        DeviceMessage::FileAck {
                            kind: ReplyKind::FileStartFail
                        }
                    )
            },
            self.link.config().conclude_timeout,
            cancel,
        )?;

        match reply.kind() {
            ReplyKind::Concluded => Ok(()),
            _ => Err(TransferError::Rejected),
        }
    }
}

/// Builds the filename as sent on the wire.
///
/// For relayed transfers the MD5 digest of the payload is appended
/// after a comma; the comma cannot occur in on-device filenames.
fn wire_file_name(file_name: &str, payload: &[u8], mcu_addr: u16) -> String {
    if mcu_addr == 0 {
        return file_name.to_string();
    }

    let digest = Md5::digest(payload);
    let mut name = String::with_capacity(file_name.len() + 1 + 32);
    name.push_str(file_name);
    name.push(',');
    for byte in digest {
        // Writing to String cannot fail.
        let _ = write!(name, "{byte:02x}");
    }
    name
}
