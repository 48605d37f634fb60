//! Error types for hcom.
//!
//! Each protocol layer has its own error enum so callers can tell a
//! malformed frame apart from a transport drop or a device rejection:
//!
//! - [`FrameError`]: undecodable or unencodable bytes. Absorbed at the
//!   dispatcher boundary on receive; surfaced to the caller on send.
//! - [`TransportError`]: the byte stream itself failed (disconnect,
//!   exhausted reconnect attempts).
//! - [`WaitError`]: a pending wait ended without a matching reply.
//! - [`CommandError`]: a device-level operation failed.
//! - [`TransferError`]: a file transfer failed. File-specific; other
//!   in-flight operations are unaffected.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error type for frame encoding and decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Fewer bytes available than a complete 12-byte header.
    #[error("truncated frame: got {0} bytes, need at least 12")]
    Truncated(usize),

    /// The header-type tag matches none of the four defined variants.
    #[error("unknown header type tag {0:#06x}")]
    UnknownType(u16),

    /// The frame body does not match the layout its header promises.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// An outbound payload would exceed the maximum packet size.
    #[error("payload of {got} bytes exceeds the {max} byte packet limit")]
    Oversize {
        /// Total frame size the payload would produce.
        got: usize,
        /// Configured maximum packet size.
        max: usize,
    },
}

/// Error type for transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device did not come back within the reconnect budget.
    #[error("device not connected after {0} reconnect attempts")]
    NotConnected(usize),
}

/// Error type for a single "send and await a matching reply" wait.
#[derive(Debug, Error)]
pub enum WaitError {
    /// No matching reply arrived before the deadline.
    #[error("timed out after {0:?} waiting for a matching reply")]
    Timeout(Duration),

    /// The wait was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The frame could not be written to the device.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error type for device-level command operations.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The device answered with a rejection.
    #[error("command rejected by device")]
    Rejected,

    /// No reply arrived within the per-command timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A multi-step operation ran out of wall-clock budget.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// A reply arrived but its payload was not what the command expects.
    #[error("unexpected reply payload: {0}")]
    UnexpectedReply(String),

    /// Transport failure underneath the command.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The outbound frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A file transfer embedded in the command failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<WaitError> for CommandError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout(d) => Self::Timeout(d),
            WaitError::Cancelled => Self::Cancelled,
            WaitError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Error type for file transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The payload is empty or its source could not be read.
    #[error("transfer source is empty or unreadable")]
    SourceUnavailable,

    /// The device refused the transfer.
    #[error("transfer rejected by device")]
    Rejected,

    /// The device did not acknowledge within the timeout.
    #[error("timed out after {0:?} waiting for transfer acknowledgement")]
    Timeout(Duration),

    /// The transfer was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport failure mid-transfer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A chunk could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<WaitError> for TransferError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout(d) => Self::Timeout(d),
            WaitError::Cancelled => Self::Cancelled,
            WaitError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Error type for the frame-send path (encode + write).
#[derive(Debug, Error)]
pub enum SendError {
    /// The frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The frame could not be written.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<SendError> for CommandError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Frame(e) => Self::Frame(e),
            SendError::Transport(e) => Self::Transport(e),
        }
    }
}

impl From<SendError> for TransferError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Frame(e) => Self::Frame(e),
            SendError::Transport(e) => Self::Transport(e),
        }
    }
}
