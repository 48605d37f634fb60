//! Request and reply code tables.
//!
//! Both directions use closed enumerations. Host-to-device codes are
//! listed in [`RequestCode`]; device-to-host codes in [`ReplyKind`].
//! Unknown codes arriving from the device map to [`ReplyKind::Unknown`]
//! and are dropped by the dispatcher rather than treated as fatal.

/// Host-to-device request code (low byte of `request_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    /// Create the on-device filesystem.
    CreateFileSystem = 0x01,
    /// Format the on-device filesystem.
    FormatFileSystem = 0x02,
    /// Mount the on-device filesystem.
    MountFileSystem = 0x03,
    /// Initialize the on-device filesystem.
    InitFileSystem = 0x04,
    /// Set the secondary runtime to auto-start.
    EnableRunMode = 0x05,
    /// Clear the secondary runtime auto-start flag.
    DisableRunMode = 0x06,
    /// Query the current run-mode state.
    QueryRunMode = 0x07,
    /// Reset the device. Fire-and-forget: the device cannot acknowledge
    /// before it resets.
    Reset = 0x08,
    /// Reboot into DFU mode. Fire-and-forget for the same reason.
    EnterDfu = 0x09,
    /// Route the device shell over the link.
    EnableShell = 0x0A,
    /// Stop routing the device shell.
    DisableShell = 0x0B,
    /// Route trace output over the link.
    EnableTraceRouting = 0x0C,
    /// Stop routing trace output.
    DisableTraceRouting = 0x0D,
    /// List files on the device.
    ListFiles = 0x0E,
    /// List files together with their CRC32s.
    ListFileCrcs = 0x0F,
    /// Erase the device flash.
    EraseFlash = 0x10,
    /// Erase the device flash and verify the erase.
    EraseFlashVerify = 0x11,
    /// Open a file transfer.
    StartFileTransfer = 0x12,
    /// Delete a file on the device.
    DeleteFile = 0x13,
    /// Signal the end of a transfer (or transfer batch).
    ConcludeTransfer = 0x14,
    /// Open a file transfer targeting the ESP32 radio.
    StartEspTransfer = 0x15,
    /// Read the device MAC address.
    ReadMacAddress = 0x16,
    /// Restart the secondary radio.
    RestartRadio = 0x17,
    /// Apply a previously transferred runtime update.
    UpdateRuntime = 0x18,
    /// Raw debugger pass-through.
    DebugCommand = 0x19,
    /// Query device information.
    GetDeviceInfo = 0x1A,
    /// Query the device name.
    GetDeviceName = 0x1B,
}

impl RequestCode {
    /// Returns the wire code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Device-to-host reply kind (low byte of `request_type`).
///
/// The mapping from wire code to kind is total: codes outside the table
/// become [`ReplyKind::Unknown`] instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Command accepted, processing continues.
    Accepted,
    /// Command rejected.
    Rejected,
    /// Multi-step operation finished.
    Concluded,
    /// Device-side error report.
    Error,
    /// Informational reply (e.g. run-mode state in `user_data`).
    Info,
    /// Start of a file listing; prior listing state is stale.
    ListHeader,
    /// One file listing entry.
    ListMember,
    /// One file listing entry with CRC.
    CrcMember,
    /// Device stdout passthrough.
    Stdout,
    /// Device stderr passthrough.
    Stderr,
    /// The device is about to cycle its link.
    Reconnect,
    /// File transfer accepted.
    FileStartOk,
    /// File transfer refused.
    FileStartFail,
    /// Debugger pass-through data.
    DebugData,
    /// Device information text.
    DeviceInfo,
    /// Device name text.
    DeviceName,
    /// Any code outside the table.
    Unknown(u8),
}

impl ReplyKind {
    /// Maps a wire code to a reply kind. Total: never fails.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Accepted,
            0x02 => Self::Rejected,
            0x03 => Self::Concluded,
            0x04 => Self::Error,
            0x05 => Self::Info,
            0x06 => Self::ListHeader,
            0x07 => Self::ListMember,
            0x08 => Self::CrcMember,
            0x09 => Self::Stdout,
            0x0A => Self::Stderr,
            0x0B => Self::Reconnect,
            0x0C => Self::FileStartOk,
            0x0D => Self::FileStartFail,
            0x0E => Self::DebugData,
            0x0F => Self::DeviceInfo,
            0x10 => Self::DeviceName,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Accepted => 0x01,
            Self::Rejected => 0x02,
            Self::Concluded => 0x03,
            Self::Error => 0x04,
            Self::Info => 0x05,
            Self::ListHeader => 0x06,
            Self::ListMember => 0x07,
            Self::CrcMember => 0x08,
            Self::Stdout => 0x09,
            Self::Stderr => 0x0A,
            Self::Reconnect => 0x0B,
            Self::FileStartOk => 0x0C,
            Self::FileStartFail => 0x0D,
            Self::DebugData => 0x0E,
            Self::DeviceInfo => 0x0F,
            Self::DeviceName => 0x10,
            Self::Unknown(code) => code,
        }
    }

    /// Whether this kind is part of the closed reply table.
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}
