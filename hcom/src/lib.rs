//! Host-side driver for the HCOM binary serial protocol.
//!
//! HCOM controls and reprograms an embedded device over a reliable
//! byte stream (serial or USB-CDC). Every frame starts with the same
//! 12-byte little-endian header; the high byte of its `request_type`
//! field selects one of four frame shapes and the low byte carries the
//! request or reply code.
//!
//! The crate is layered bottom-up:
//!
//! - [`transport`]: the [`Transport`] trait and the serial
//!   implementation (behind the `native` feature).
//! - [`protocol`]: frame encode/decode, code tables, typed messages.
//! - [`link`]: the write side; sequence numbers and configuration.
//! - [`dispatch`]: the background drain thread and the message bus.
//! - [`coordinator`]: matching outbound commands to inbound replies.
//! - [`transfer`]: chunked file transfers with CRC32/MD5 integrity.
//! - [`device`]: one method per device operation.
//!
//! # Example
//!
//! ```no_run
//! use hcom::{CancelToken, Device, LinkConfig, SerialTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let port = SerialTransport::open("/dev/ttyUSB0", 921_600)?;
//! let device = Device::new(Box::new(port), LinkConfig::default());
//!
//! let cancel = CancelToken::new();
//! println!("{}", device.device_info(&cancel)?);
//! device.write_file("app.bin", 0, &std::fs::read("app.bin")?, &cancel)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod coordinator;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod protocol;
pub mod transfer;
pub mod transport;

pub use coordinator::{CancelToken, Coordinator};
pub use device::{ConsoleLine, ConsoleTap, DebugTap, Device};
pub use dispatch::{MessageBus, ReceiveDispatcher};
pub use error::{CommandError, FrameError, TransferError, TransportError, WaitError};
pub use link::{Link, LinkConfig};
pub use protocol::{DeviceMessage, ReplyKind, RequestCode};
pub use transfer::{FileTransferEngine, TransferStats};
pub use transport::Transport;

#[cfg(feature = "native")]
pub use transport::serial::SerialTransport;
