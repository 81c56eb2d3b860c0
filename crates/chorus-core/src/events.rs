//! Events broadcast to connected clients.
//!
//! Every state change that clients observe flows through one of these
//! variants. The server encodes them into `Frame::Event` pushes; the event
//! name doubles as the wire-level event tag.

use serde::{Deserialize, Serialize};

use crate::call::{Call, CallParticipant};
use crate::message::Message;
use crate::{CallId, ChatId, MessageId, UserId};

/// An event delivered to clients through the broadcast bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    // --- Chat ---
    MessageReceived {
        message: Message,
    },
    UserTyping {
        chat_id: ChatId,
        user_id: UserId,
    },
    UserStoppedTyping {
        chat_id: ChatId,
        user_id: UserId,
    },
    ReactionAdded {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ReactionRemoved {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    MessageDelivered {
        message_id: MessageId,
        user_id: UserId,
        delivered_count: usize,
    },
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
        read_count: usize,
    },

    // --- Presence ---
    UserStatusChanged {
        user_id: UserId,
        online: bool,
    },

    // --- Calls ---
    CallStarted {
        call: Call,
        participants: Vec<CallParticipant>,
    },
    CallParticipantJoined {
        call_id: CallId,
        user_id: UserId,
        participants: Vec<CallParticipant>,
    },
    CallParticipantLeft {
        call_id: CallId,
        user_id: UserId,
        /// Whether this leave ended the call.
        ended: bool,
    },
    CallEnded {
        call_id: CallId,
        duration_secs: Option<u64>,
    },
    ParticipantMuted {
        call_id: CallId,
        user_id: UserId,
        muted: bool,
    },
    ParticipantVideoToggled {
        call_id: CallId,
        user_id: UserId,
        video_enabled: bool,
    },
    ParticipantScreenShareToggled {
        call_id: CallId,
        user_id: UserId,
        screen_sharing: bool,
    },

    // --- Media negotiation (opaque, targeted at one user) ---
    ReceiveOffer {
        call_id: CallId,
        from_user_id: UserId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    ReceiveAnswer {
        call_id: CallId,
        from_user_id: UserId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    ReceiveIceCandidate {
        call_id: CallId,
        from_user_id: UserId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl ServerEvent {
    /// Wire-level name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageReceived { .. } => "message_received",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStoppedTyping { .. } => "user_stopped_typing",
            ServerEvent::ReactionAdded { .. } => "reaction_added",
            ServerEvent::ReactionRemoved { .. } => "reaction_removed",
            ServerEvent::MessageDelivered { .. } => "message_delivered",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::UserStatusChanged { .. } => "user_status_changed",
            ServerEvent::CallStarted { .. } => "call_started",
            ServerEvent::CallParticipantJoined { .. } => "call_participant_joined",
            ServerEvent::CallParticipantLeft { .. } => "call_participant_left",
            ServerEvent::CallEnded { .. } => "call_ended",
            ServerEvent::ParticipantMuted { .. } => "participant_muted",
            ServerEvent::ParticipantVideoToggled { .. } => "participant_video_toggled",
            ServerEvent::ParticipantScreenShareToggled { .. } => "participant_screen_share_toggled",
            ServerEvent::ReceiveOffer { .. } => "receive_offer",
            ServerEvent::ReceiveAnswer { .. } => "receive_answer",
            ServerEvent::ReceiveIceCandidate { .. } => "receive_ice_candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_serde_tags() {
        let event = ServerEvent::UserStatusChanged {
            user_id: "alice".into(),
            online: true,
        };
        assert_eq!(event.name(), "user_status_changed");

        let event = ServerEvent::ReceiveIceCandidate {
            call_id: "call-1".into(),
            from_user_id: "bob".into(),
            payload: vec![1, 2, 3],
        };
        assert_eq!(event.name(), "receive_ice_candidate");
    }
}
