//! Chat message domain types.
//!
//! Messages themselves are thin request/response CRUD handled by the
//! persistence collaborator; the engine only needs enough shape to broadcast
//! them and to track delivery/read receipts.

use chorus_protocol::MessageKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::{ChatId, MessageId, UserId};

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl Message {
    /// Create a new message stamped with the current time.
    #[must_use]
    pub fn new(
        chat_id: impl Into<ChatId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            kind,
            sent_at: clock::now_millis(),
        }
    }
}

/// An emoji reaction attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub reacted_at: u64,
}

impl Reaction {
    /// Create a reaction stamped with the current time.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, emoji: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            emoji: emoji.into(),
            reacted_at: clock::now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_get_unique_ids() {
        let a = Message::new("chat-1", "user-1", "hi", MessageKind::Text);
        let b = Message::new("chat-1", "user-1", "hi", MessageKind::Text);
        assert_ne!(a.id, b.id);
        assert!(a.sent_at > 0);
    }
}
