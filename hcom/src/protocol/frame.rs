//! HCOM frame encoding and decoding.
//!
//! Every HCOM frame starts with the same 12-byte little-endian header:
//!
//! ```text
//! +----------+---------+--------------+------------+-----------+
//! | sequence | version | request_type | extra_data | user_data |
//! +----------+---------+--------------+------------+-----------+
//! | 2 bytes  | 2 bytes |   2 bytes    |  2 bytes   |  4 bytes  |
//! +----------+---------+--------------+------------+-----------+
//! ```
//!
//! The high byte of `request_type` carries the header-type tag and the
//! low byte the request code, combined by bitwise OR. The four header
//! types and their bodies:
//!
//! | Tag      | Meaning      | Body                                      |
//! |----------|--------------|-------------------------------------------|
//! | `0x0100` | Simple       | none (4-byte user_data in the header)     |
//! | `0x0200` | FileStart    | partition(4) + size(4) + crc(4) + name    |
//! | `0x0300` | SimpleText   | UTF-8 text                                |
//! | `0x0400` | SimpleBinary | raw bytes, total frame <= max packet size |
//!
//! The FileStart filename has no terminator; its length is implied by
//! the total frame size.

use crate::error::FrameError;
use byteorder::{LittleEndian, WriteBytesExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Default maximum total frame size in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Default protocol version carried in every header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Length of the fixed portion of a FileStart body.
const FILE_START_FIXED_LEN: usize = 12;

/// Header-type tag carried in the high byte of `request_type`.
///
/// Tags and request codes occupy disjoint bit ranges, so a combined
/// `request_type` always splits cleanly back into both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HeaderType {
    /// Header only; the 4-byte `user_data` field is the payload.
    Simple = 0x0100,
    /// Opens (or deletes) a file transfer.
    FileStart = 0x0200,
    /// UTF-8 text body. Used only on receive.
    SimpleText = 0x0300,
    /// Raw binary body.
    SimpleBinary = 0x0400,
}

impl HeaderType {
    /// Returns the tag value for this header type.
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Maps a tag back to a header type, if it is one of the four.
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0x0100 => Some(Self::Simple),
            0x0200 => Some(Self::FileStart),
            0x0300 => Some(Self::SimpleText),
            0x0400 => Some(Self::SimpleBinary),
            _ => None,
        }
    }
}

/// Decoded 12-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame sequence number.
    pub sequence: u16,
    /// Protocol version.
    pub version: u16,
    /// Header-type tag (high byte) combined with the request code (low byte).
    pub request_type: u16,
    /// Type-specific extra field (e.g. destination MCU address).
    pub extra_data: u16,
    /// Type-specific user field (e.g. chunk offset, run-mode state).
    pub user_data: u32,
}

impl Header {
    /// Returns the header type encoded in `request_type`, if valid.
    pub fn header_type(&self) -> Option<HeaderType> {
        HeaderType::from_tag(self.request_type & 0xFF00)
    }

    /// Returns the request code encoded in `request_type`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn code(&self) -> u8 {
        (self.request_type & 0x00FF) as u8
    }

    /// Appends the 12-byte wire representation to `buf`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<LittleEndian>(self.sequence).unwrap();
        buf.write_u16::<LittleEndian>(self.version).unwrap();
        buf.write_u16::<LittleEndian>(self.request_type).unwrap();
        buf.write_u16::<LittleEndian>(self.extra_data).unwrap();
        buf.write_u32::<LittleEndian>(self.user_data).unwrap();
    }

    /// Reads a header from the first 12 bytes of `raw`.
    fn read_from(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_LEN {
            return Err(FrameError::Truncated(raw.len()));
        }

        Ok(Self {
            sequence: u16::from_le_bytes([raw[0], raw[1]]),
            version: u16::from_le_bytes([raw[2], raw[3]]),
            request_type: u16::from_le_bytes([raw[4], raw[5]]),
            extra_data: u16::from_le_bytes([raw[6], raw[7]]),
            user_data: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        })
    }
}

/// Fixed fields of a FileStart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStartBody {
    /// Target partition identifier.
    pub partition: u32,
    /// Total file size in bytes.
    pub file_size: u32,
    /// CRC32 of the full file payload.
    pub checksum: u32,
    /// Target filename (UTF-8, no terminator).
    pub file_name: String,
}

/// Decoded frame body, one variant per header type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Simple frame: no body.
    None,
    /// FileStart frame body.
    FileStart(FileStartBody),
    /// SimpleText frame body.
    Text(String),
    /// SimpleBinary frame body.
    Binary(Vec<u8>),
}

/// Encoder/decoder for HCOM frames.
///
/// Carries the protocol version and packet-size limit as explicit
/// configuration rather than global state, so two links speaking
/// different versions can coexist in one process.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: u16,
    max_packet_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, MAX_PACKET_SIZE)
    }
}

impl FrameCodec {
    /// Creates a codec for the given protocol version and packet limit.
    pub fn new(version: u16, max_packet_size: usize) -> Self {
        Self {
            version,
            max_packet_size,
        }
    }

    /// Returns the configured maximum total frame size.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Returns the largest body a SimpleBinary frame may carry.
    pub fn max_chunk_size(&self) -> usize {
        self.max_packet_size - HEADER_LEN
    }

    fn header(&self, sequence: u16, header_type: HeaderType, code: u8, extra_data: u16, user_data: u32) -> Header {
        Header {
            sequence,
            version: self.version,
            request_type: header_type.tag() | u16::from(code),
            extra_data,
            user_data,
        }
    }

    /// Encodes a Simple frame: 12-byte header only.
    pub fn encode_simple(&self, sequence: u16, code: u8, user_data: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        self.header(sequence, HeaderType::Simple, code, 0, user_data)
            .write_to(&mut buf);
        buf
    }

    /// Encodes a FileStart frame: header + 12 fixed bytes + filename.
    ///
    /// `extra_data` carries the destination MCU address (0 = primary).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode_file_start(
        &self,
        sequence: u16,
        code: u8,
        partition: u32,
        file_size: u32,
        checksum: u32,
        file_name: &str,
        extra_data: u16,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + FILE_START_FIXED_LEN + file_name.len());
        self.header(sequence, HeaderType::FileStart, code, extra_data, 0)
            .write_to(&mut buf);
        buf.write_u32::<LittleEndian>(partition).unwrap();
        buf.write_u32::<LittleEndian>(file_size).unwrap();
        buf.write_u32::<LittleEndian>(checksum).unwrap();
        buf.extend_from_slice(file_name.as_bytes());
        buf
    }

    /// Encodes a SimpleBinary frame: header + raw payload.
    ///
    /// Fails with [`FrameError::Oversize`] if the total frame would
    /// exceed the packet limit; payloads are never silently truncated.
    pub fn encode_binary(
        &self,
        sequence: u16,
        code: u8,
        user_data: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, FrameError> {
        let total = HEADER_LEN + payload.len();
        if total > self.max_packet_size {
            return Err(FrameError::Oversize {
                got: total,
                max: self.max_packet_size,
            });
        }

        let mut buf = Vec::with_capacity(total);
        self.header(sequence, HeaderType::SimpleBinary, code, 0, user_data)
            .write_to(&mut buf);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Decodes one complete frame from `raw`.
    ///
    /// `raw` must hold exactly one frame; variable-length bodies extend
    /// to the end of the buffer.
    pub fn decode(raw: &[u8]) -> Result<(Header, Body), FrameError> {
        let header = Header::read_from(raw)?;
        let body = &raw[HEADER_LEN..];

        let header_type = header
            .header_type()
            .ok_or(FrameError::UnknownType(header.request_type & 0xFF00))?;

        let body = match header_type {
            HeaderType::Simple => Body::None,
            HeaderType::FileStart => {
                if body.len() < FILE_START_FIXED_LEN {
                    return Err(FrameError::Malformed(format!(
                        "FileStart body of {} bytes, need at least {FILE_START_FIXED_LEN}",
                        body.len()
                    )));
                }
                let partition = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let file_size = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let checksum = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
                let file_name = std::str::from_utf8(&body[FILE_START_FIXED_LEN..])
                    .map_err(|e| FrameError::Malformed(format!("FileStart filename: {e}")))?
                    .to_string();
                Body::FileStart(FileStartBody {
                    partition,
                    file_size,
                    checksum,
                    file_name,
                })
            },
            // Console passthrough can split multi-byte characters across
            // frames, so text decode is lossy rather than fatal.
            HeaderType::SimpleText => Body::Text(String::from_utf8_lossy(body).into_owned()),
            HeaderType::SimpleBinary => Body::Binary(body.to_vec()),
        };

        Ok((header, body))
    }
}
