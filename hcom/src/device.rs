//! High-level device operations.
//!
//! [`Device`] owns the whole stack for one connection: the link, the
//! dispatch thread, the coordinator and the transfer engine. Every
//! public method is one device-level operation with its own error
//! handling, retry policy and timeout taken from [`LinkConfig`].
//!
//! Operations that may block for a long time take a [`CancelToken`];
//! cancellation is observed between protocol steps and inside waits.

use crate::coordinator::{CancelToken, Coordinator};
use crate::dispatch::{ListenerGuard, MessageBus, ReceiveDispatcher};
use crate::error::{CommandError, TransferError, WaitError};
use crate::link::{Link, LinkConfig};
use crate::protocol::codes::{ReplyKind, RequestCode};
use crate::protocol::message::DeviceMessage;
use crate::transfer::{FileTransferEngine, TransferStats};
use crate::transport::Transport;
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// One line of console output routed from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    /// [`ReplyKind::Stdout`] or [`ReplyKind::Stderr`].
    pub stream: ReplyKind,
    /// Text as received; the device controls line boundaries.
    pub text: String,
}

/// Subscription to console passthrough messages.
///
/// Dropping the tap ends the subscription.
pub struct ConsoleTap {
    _guard: ListenerGuard,
    /// Receiving end of the console stream.
    pub rx: Receiver<ConsoleLine>,
}

/// Subscription to debugger passthrough data.
///
/// Dropping the tap ends the subscription.
pub struct DebugTap {
    _guard: ListenerGuard,
    /// Receiving end of the debugger stream.
    pub rx: Receiver<Vec<u8>>,
}

/// A connected HCOM device.
pub struct Device {
    link: Arc<Link>,
    bus: MessageBus,
    coordinator: Coordinator,
    engine: FileTransferEngine,
    _dispatcher: ReceiveDispatcher,
}

impl Device {
    /// Builds the full stack over a transport and starts the dispatch
    /// thread.
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        let max_packet_size = config.max_packet_size;
        let link = Arc::new(Link::new(transport, config));
        let bus = MessageBus::new();
        let dispatcher =
            ReceiveDispatcher::spawn(Arc::clone(link.transport()), bus.clone(), max_packet_size);
        let coordinator = Coordinator::new(Arc::clone(&link), bus.clone());
        let engine = FileTransferEngine::new(Arc::clone(&link), coordinator.clone());

        Self {
            link,
            bus,
            coordinator,
            engine,
            _dispatcher: dispatcher,
        }
    }

    /// Returns the link configuration.
    pub fn config(&self) -> &LinkConfig {
        self.link.config()
    }

    fn text_query(
        &self,
        code: RequestCode,
        reply: ReplyKind,
        cancel: &CancelToken,
    ) -> Result<String, CommandError> {
        let frame = self.link.encode_simple(code, 0);
        let msg = self.coordinator.send_and_await(
            &frame,
            move |m| matches!(m, DeviceMessage::Text { kind, .. } if *kind == reply),
            self.link.config().command_timeout,
            cancel,
        )?;

        match msg {
            DeviceMessage::Text { text, .. } => Ok(text),
            other => Err(CommandError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Queries the device information string.
    pub fn device_info(&self, cancel: &CancelToken) -> Result<String, CommandError> {
        self.text_query(RequestCode::GetDeviceInfo, ReplyKind::DeviceInfo, cancel)
    }

    /// Queries the device name.
    pub fn device_name(&self, cancel: &CancelToken) -> Result<String, CommandError> {
        self.text_query(RequestCode::GetDeviceName, ReplyKind::DeviceName, cancel)
    }

    /// Queries whether the secondary runtime auto-starts.
    pub fn query_run_mode(&self, cancel: &CancelToken) -> Result<bool, CommandError> {
        let frame = self.link.encode_simple(RequestCode::QueryRunMode, 0);
        let msg = self.coordinator.send_and_await(
            &frame,
            |m| matches!(m, DeviceMessage::Simple { kind: ReplyKind::Info, .. }),
            self.link.config().command_timeout,
            cancel,
        )?;

        match msg {
            DeviceMessage::Simple { user_data, .. } => Ok(user_data != 0),
            other => Err(CommandError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Drives the run-mode flag to `target`, rebooting as needed.
    ///
    /// The flag only takes effect across a device reboot, and some
    /// firmware revisions need more than one toggle cycle before the
    /// queried state matches. Each cycle is toggle, settle, reconnect,
    /// wait for readiness, re-query; cycles repeat until the state
    /// matches or the wall-clock deadline expires.
    pub fn set_run_mode(&self, target: bool, cancel: &CancelToken) -> Result<(), CommandError> {
        let config = self.link.config();
        let deadline = Instant::now() + config.mode_toggle_deadline;

        loop {
            if cancel.is_cancelled() {
                return Err(CommandError::Cancelled);
            }

            let current = self.query_run_mode(cancel)?;
            if current == target {
                debug!("run mode now {target}");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CommandError::DeadlineExceeded(config.mode_toggle_deadline));
            }

            let code = if target {
                RequestCode::EnableRunMode
            } else {
                RequestCode::DisableRunMode
            };
            info!("toggling run mode to {target}, device will reboot");

            let frame = self.link.encode_simple(code, 0);
            match self.coordinator.send_and_await(
                &frame,
                |m| m.kind() == ReplyKind::Reconnect,
                config.command_timeout,
                cancel,
            ) {
                Ok(_) => {},
                // Some revisions reboot without announcing it.
                Err(WaitError::Timeout(_)) => {
                    warn!("no reconnect notice after run-mode toggle, assuming reboot");
                },
                Err(e) => return Err(e.into()),
            }

            thread::sleep(config.settle_delay);
            self.link.reconnect()?;
            self.wait_ready(cancel)?;
        }
    }

    /// Resets the device and waits for it to come back.
    ///
    /// The reset frame is fire-and-forget: the device cannot acknowledge
    /// a command that kills its own link.
    pub fn reset(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        info!("resetting device");
        self.link.send_simple(RequestCode::Reset, 0)?;
        thread::sleep(self.link.config().settle_delay);
        self.link.reconnect()?;
        self.wait_ready(cancel)
    }

    /// Reboots the device into DFU mode. Fire-and-forget; the device
    /// does not speak this protocol once in DFU.
    pub fn enter_dfu(&self) -> Result<(), CommandError> {
        info!("rebooting device into DFU mode");
        self.link.send_simple(RequestCode::EnterDfu, 0)?;
        Ok(())
    }

    /// Polls the device until it answers an info query.
    ///
    /// Transport errors and timeouts during the poll are expected while
    /// the device boots; only the wall-clock deadline is fatal.
    pub fn wait_ready(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        let config = self.link.config();
        let deadline = Instant::now() + config.ready_deadline;

        loop {
            if cancel.is_cancelled() {
                return Err(CommandError::Cancelled);
            }

            let frame = self.link.encode_simple(RequestCode::GetDeviceInfo, 0);
            match self.coordinator.send_and_await(
                &frame,
                |m| matches!(m, DeviceMessage::Text { kind: ReplyKind::DeviceInfo, .. }),
                config.ready_poll_interval,
                cancel,
            ) {
                Ok(_) => {
                    debug!("device ready");
                    return Ok(());
                },
                Err(WaitError::Cancelled) => return Err(CommandError::Cancelled),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(CommandError::DeadlineExceeded(config.ready_deadline));
                    }
                    trace!("device not ready yet: {e}");
                },
            }
        }
    }

    /// Lists files on the device, optionally with their CRC32s.
    ///
    /// Entries without a CRC map to zero. A listing restarts cleanly if
    /// the device sends a second header mid-stream.
    pub fn list_files(
        &self,
        with_crc: bool,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, u32>, CommandError> {
        let code = if with_crc {
            RequestCode::ListFileCrcs
        } else {
            RequestCode::ListFiles
        };

        let state: Arc<Mutex<(bool, BTreeMap<String, u32>)>> =
            Arc::new(Mutex::new((false, BTreeMap::new())));
        let sink = Arc::clone(&state);
        let _listener = self.bus.add_listener(move |msg| {
            let DeviceMessage::Text { kind, text } = msg else {
                return;
            };
            let mut state = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match kind {
                ReplyKind::ListHeader => {
                    state.0 = true;
                    state.1.clear();
                },
                // Entries before the header belong to a stale listing.
                ReplyKind::ListMember | ReplyKind::CrcMember if state.0 => {
                    match parse_list_entry(text) {
                        Some((name, crc)) => {
                            state.1.insert(name, crc);
                        },
                        None => warn!("unparseable file list entry: {text:?}"),
                    }
                },
                _ => {},
            }
        });

        let frame = self.link.encode_simple(code, 0);
        self.coordinator.send_and_await(
            &frame,
            |m| m.kind() == ReplyKind::Concluded,
            self.link.config().conclude_timeout,
            cancel,
        )?;

        let mut state = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(std::mem::take(&mut state.1))
    }

    /// Writes a file to the device filesystem.
    pub fn write_file(
        &self,
        file_name: &str,
        partition: u32,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<TransferStats, TransferError> {
        self.engine.send_file(
            RequestCode::StartFileTransfer,
            file_name,
            partition,
            payload,
            0,
            true,
            cancel,
        )
    }

    /// Deletes a file on the device filesystem.
    pub fn delete_file(&self, file_name: &str, cancel: &CancelToken) -> Result<(), TransferError> {
        self.engine.delete_file(file_name, cancel)
    }

    /// Flashes a batch of images to the ESP32 radio.
    ///
    /// All images ride one transfer session: only the final image is
    /// followed by a ConcludeTransfer, so the radio flashes the batch
    /// atomically.
    pub fn flash_esp(
        &self,
        images: &[(&str, &[u8])],
        mcu_addr: u16,
        cancel: &CancelToken,
    ) -> Result<Vec<TransferStats>, TransferError> {
        let mut stats = Vec::with_capacity(images.len());
        for (index, (name, payload)) in images.iter().enumerate() {
            let last = index + 1 == images.len();
            stats.push(self.engine.send_file(
                RequestCode::StartEspTransfer,
                name,
                0,
                payload,
                mcu_addr,
                last,
                cancel,
            )?);
        }
        Ok(stats)
    }

    /// Writes a runtime image and tells the device to apply it.
    pub fn update_runtime(
        &self,
        file_name: &str,
        partition: u32,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<(), CommandError> {
        self.write_file(file_name, partition, payload, cancel)?;
        self.coordinator.process_simple_command(
            RequestCode::UpdateRuntime,
            ReplyKind::Concluded,
            0,
            self.link.config().conclude_timeout,
            cancel,
        )
    }

    /// Erases the device flash, optionally verifying the erase.
    pub fn erase_flash(&self, verify: bool, cancel: &CancelToken) -> Result<(), CommandError> {
        let code = if verify {
            RequestCode::EraseFlashVerify
        } else {
            RequestCode::EraseFlash
        };
        self.coordinator.process_simple_command(
            code,
            ReplyKind::Concluded,
            0,
            self.link.config().conclude_timeout,
            cancel,
        )
    }

    /// Creates the on-device filesystem.
    pub fn create_filesystem(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::CreateFileSystem, cancel)
    }

    /// Formats the on-device filesystem.
    pub fn format_filesystem(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::FormatFileSystem, cancel)
    }

    /// Mounts the on-device filesystem.
    pub fn mount_filesystem(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::MountFileSystem, cancel)
    }

    /// Initializes the on-device filesystem.
    pub fn init_filesystem(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::InitFileSystem, cancel)
    }

    /// Routes the device shell over the link.
    pub fn enable_shell(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::EnableShell, cancel)
    }

    /// Stops routing the device shell.
    pub fn disable_shell(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::DisableShell, cancel)
    }

    /// Routes trace output over the link.
    pub fn enable_trace_routing(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::EnableTraceRouting, cancel)
    }

    /// Stops routing trace output.
    pub fn disable_trace_routing(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::DisableTraceRouting, cancel)
    }

    /// Restarts the secondary radio.
    pub fn restart_radio(&self, cancel: &CancelToken) -> Result<(), CommandError> {
        self.simple(RequestCode::RestartRadio, cancel)
    }

    fn simple(&self, code: RequestCode, cancel: &CancelToken) -> Result<(), CommandError> {
        self.coordinator.process_simple_command(
            code,
            ReplyKind::Concluded,
            0,
            self.link.config().command_timeout,
            cancel,
        )
    }

    /// Reads the device MAC address.
    pub fn read_mac_address(&self, cancel: &CancelToken) -> Result<[u8; 6], CommandError> {
        let frame = self.link.encode_simple(RequestCode::ReadMacAddress, 0);
        let msg = self.coordinator.send_and_await(
            &frame,
            |m| matches!(m, DeviceMessage::Binary { kind: ReplyKind::Info, .. }),
            self.link.config().command_timeout,
            cancel,
        )?;

        match msg {
            DeviceMessage::Binary { data, .. } => data.as_slice().try_into().map_err(|_| {
                CommandError::UnexpectedReply(format!("MAC reply of {} bytes, need 6", data.len()))
            }),
            other => Err(CommandError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Sends a raw debugger command. Fire-and-forget; responses arrive
    /// on the [`DebugTap`] stream.
    pub fn send_debug_command(&self, payload: &[u8]) -> Result<(), CommandError> {
        let frame = self
            .link
            .encode_binary(RequestCode::DebugCommand, 0, payload)?;
        self.link.send_raw(&frame)?;
        Ok(())
    }

    /// Subscribes to console passthrough output.
    pub fn subscribe_console(&self) -> ConsoleTap {
        let (tx, rx) = mpsc::channel();
        let guard = self.bus.add_listener(move |msg| {
            if let DeviceMessage::Text { kind, text } = msg {
                if matches!(kind, ReplyKind::Stdout | ReplyKind::Stderr) {
                    let _ = tx.send(ConsoleLine {
                        stream: *kind,
                        text: text.clone(),
                    });
                }
            }
        });
        ConsoleTap { _guard: guard, rx }
    }

    /// Subscribes to debugger passthrough data.
    pub fn subscribe_debug(&self) -> DebugTap {
        let (tx, rx) = mpsc::channel();
        let guard = self.bus.add_listener(move |msg| {
            if let DeviceMessage::Binary { kind: ReplyKind::DebugData, data } = msg {
                let _ = tx.send(data.clone());
            }
        });
        DebugTap { _guard: guard, rx }
    }
}

/// Parses one file listing entry.
///
/// CRC entries look like `name [DEADBEEF`; the device omits the closing
/// bracket on some revisions, so both `[HEX` and `[HEX]` parse. Plain
/// entries are just the name and map to a zero CRC.
fn parse_list_entry(text: &str) -> Option<(String, u32)> {
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return None;
    }

    match text.rsplit_once(" [") {
        Some((name, rest)) => {
            let crc = u32::from_str_radix(rest.trim_end_matches(']'), 16).ok()?;
            Some((name.to_string(), crc))
        },
        None => Some((text.to_string(), 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_entry_with_crc() {
        assert_eq!(
            parse_list_entry("app.exe [DEADBEEF"),
            Some(("app.exe".to_string(), 0xDEAD_BEEF))
        );
        assert_eq!(
            parse_list_entry("lib.dll [0BAD0BAD"),
            Some(("lib.dll".to_string(), 0x0BAD_0BAD))
        );
    }

    #[test]
    fn test_parse_list_entry_closing_bracket_tolerated() {
        assert_eq!(
            parse_list_entry("fw.bin [00C0FFEE]"),
            Some(("fw.bin".to_string(), 0x00C0_FFEE))
        );
    }

    #[test]
    fn test_parse_list_entry_plain_name() {
        assert_eq!(parse_list_entry("notes.txt"), Some(("notes.txt".to_string(), 0)));
    }

    #[test]
    fn test_parse_list_entry_name_with_spaces() {
        // Only the last " [" starts the CRC field.
        assert_eq!(
            parse_list_entry("my file [1] [AB"),
            Some(("my file [1]".to_string(), 0xAB))
        );
    }

    #[test]
    fn test_parse_list_entry_garbage() {
        assert_eq!(parse_list_entry(""), None);
        assert_eq!(parse_list_entry("name [NOTHEX"), None);
    }
}
