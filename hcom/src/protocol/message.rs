//! Typed receive-side messages.
//!
//! The dispatcher turns each decoded inbound frame into one
//! [`DeviceMessage`] via [`DeviceMessage::from_frame`], the single
//! mapping from `(header type, reply code)` to a message variant.
//! Messages are built once per frame and never mutated afterwards.

use crate::protocol::codes::ReplyKind;
use crate::protocol::frame::{Body, Header, HeaderType};

/// One decoded device-to-host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Body-less message; the payload is the header's `user_data`.
    Simple {
        /// Reply kind.
        kind: ReplyKind,
        /// 4-byte payload from the header.
        user_data: u32,
    },
    /// Text message (info, list entries, console passthrough).
    Text {
        /// Reply kind.
        kind: ReplyKind,
        /// UTF-8 body.
        text: String,
    },
    /// Binary message (MAC address, debugger data).
    Binary {
        /// Reply kind.
        kind: ReplyKind,
        /// Raw body.
        data: Vec<u8>,
    },
    /// File transfer acknowledgement.
    FileAck {
        /// [`ReplyKind::FileStartOk`] or [`ReplyKind::FileStartFail`].
        kind: ReplyKind,
    },
}

impl DeviceMessage {
    /// Returns the reply kind of this message.
    pub fn kind(&self) -> ReplyKind {
        match self {
            Self::Simple { kind, .. }
            | Self::Text { kind, .. }
            | Self::Binary { kind, .. }
            | Self::FileAck { kind } => *kind,
        }
    }

    /// Builds a message from a decoded frame.
    ///
    /// Returns `None` for unknown reply codes and for header/body shapes
    /// the device never legitimately sends (e.g. an inbound FileStart);
    /// the dispatcher drops those frames.
    pub fn from_frame(header: &Header, body: Body) -> Option<Self> {
        let kind = ReplyKind::from_code(header.code());
        if !kind.is_known() {
            return None;
        }

        match (header.header_type()?, body) {
            (HeaderType::Simple, Body::None) => Some(match kind {
                ReplyKind::FileStartOk | ReplyKind::FileStartFail => Self::FileAck { kind },
                _ => Self::Simple {
                    kind,
                    user_data: header.user_data,
                },
            }),
            (HeaderType::SimpleText, Body::Text(text)) => Some(Self::Text { kind, text }),
            (HeaderType::SimpleBinary, Body::Binary(data)) => Some(Self::Binary { kind, data }),
            _ => None,
        }
    }
}
