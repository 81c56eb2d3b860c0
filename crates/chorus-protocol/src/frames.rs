//! Frame types for the Chorus protocol.
//!
//! A frame is either a client action (chat, call, or signaling request) or a
//! server push. Frames are serialized with MessagePack; see [`crate::codec`]
//! for the wire framing.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// The kind of call being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
    AudioRoom,
}

/// The kind of chat message being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    VoiceNote,
    File,
    Location,
    Contact,
    Sticker,
    Gif,
    System,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod error_codes {
    /// Malformed or unexpected frame.
    pub const MALFORMED: u16 = 1001;
    /// Connection has not completed the Connect handshake.
    pub const UNAUTHENTICATED: u16 = 1002;
    /// Unknown call, message, or participant.
    pub const NOT_FOUND: u16 = 1003;
    /// Action conflicts with current state (e.g. call already active).
    pub const CONFLICT: u16 = 1004;
    /// Caller is not allowed to perform the action.
    pub const UNAUTHORIZED: u16 = 1005;
    /// Persistence collaborator unavailable.
    pub const UNAVAILABLE: u16 = 1006;
    /// Signaling payload exceeds the configured limit.
    pub const PAYLOAD_TOO_LARGE: u16 = 1007;
    /// Unexpected internal failure; details are logged server-side only.
    pub const INTERNAL: u16 = 1099;
}

/// A protocol frame.
///
/// Client actions that have a caller-visible result carry a request `id`
/// which the server echoes back in an `Ack` or `Error` frame. Typing and
/// signaling actions are fire-and-forget and carry no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Initial handshake. Must be the first frame on a connection.
    Connect {
        version: u8,
        token: String,
    },

    /// Handshake accepted; the connection is registered.
    Connected {
        connection_id: String,
        user_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Acknowledgment of a client request.
    Ack { id: u64 },

    /// A client request failed.
    Error {
        /// Id of the failed request (0 when not tied to a request).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive.
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    // --- Chat actions ---
    /// Scope this connection to a chat's broadcast group.
    JoinChat { id: u64, chat_id: String },
    /// Remove this connection from a chat's broadcast group.
    LeaveChat { id: u64, chat_id: String },
    SendMessage {
        id: u64,
        chat_id: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },
    StartTyping { chat_id: String },
    StopTyping { chat_id: String },
    AddReaction {
        id: u64,
        message_id: String,
        emoji: String,
    },
    RemoveReaction {
        id: u64,
        message_id: String,
        emoji: String,
    },
    MarkRead { id: u64, message_id: String },
    MarkDelivered { id: u64, message_id: String },

    // --- Call actions ---
    StartCall {
        id: u64,
        chat_id: String,
        kind: CallKind,
    },
    JoinCall { id: u64, call_id: String },
    LeaveCall { id: u64, call_id: String },
    EndCall { id: u64, call_id: String },
    ToggleMute { id: u64, call_id: String },
    ToggleVideo { id: u64, call_id: String },
    ToggleScreenShare { id: u64, call_id: String },

    // --- Media negotiation signaling (opaque payloads) ---
    Offer {
        call_id: String,
        target_user_id: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Answer {
        call_id: String,
        target_user_id: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    IceCandidate {
        call_id: String,
        target_user_id: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Server push. `event` names the event and `payload` is its
    /// MessagePack-encoded body.
    Event {
        event: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Create a Connect frame.
    #[must_use]
    pub fn connect(token: impl Into<String>) -> Self {
        Frame::Connect {
            version: PROTOCOL_VERSION,
            token: token.into(),
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame echoing a ping timestamp.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(event: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Event {
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// The request id carried by this frame, if it expects an ack.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::JoinChat { id, .. }
            | Frame::LeaveChat { id, .. }
            | Frame::SendMessage { id, .. }
            | Frame::AddReaction { id, .. }
            | Frame::RemoveReaction { id, .. }
            | Frame::MarkRead { id, .. }
            | Frame::MarkDelivered { id, .. }
            | Frame::StartCall { id, .. }
            | Frame::JoinCall { id, .. }
            | Frame::LeaveCall { id, .. }
            | Frame::EndCall { id, .. }
            | Frame::ToggleMute { id, .. }
            | Frame::ToggleVideo { id, .. }
            | Frame::ToggleScreenShare { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_present_on_acked_actions() {
        let frame = Frame::StartCall {
            id: 7,
            chat_id: "chat-1".into(),
            kind: CallKind::Video,
        };
        assert_eq!(frame.request_id(), Some(7));

        let frame = Frame::StartTyping {
            chat_id: "chat-1".into(),
        };
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn signaling_frames_carry_opaque_payloads() {
        let frame = Frame::Offer {
            call_id: "call-1".into(),
            target_user_id: "user-2".into(),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        // Payload bytes are not interpreted by the protocol layer.
        if let Frame::Offer { payload, .. } = &frame {
            assert_eq!(payload.len(), 4);
        }
    }

    #[test]
    fn message_kind_defaults_to_text() {
        assert_eq!(MessageKind::default(), MessageKind::Text);
    }
}
