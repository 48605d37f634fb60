//! HCOM wire protocol: framing, code tables, typed messages.

pub mod codes;
pub mod frame;
pub mod message;

// Re-export common types
pub use codes::{ReplyKind, RequestCode};
pub use frame::{
    Body, FileStartBody, FrameCodec, Header, HeaderType, HEADER_LEN, MAX_PACKET_SIZE,
    PROTOCOL_VERSION,
};
pub use message::DeviceMessage;
