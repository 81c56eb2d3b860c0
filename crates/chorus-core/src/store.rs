//! Collaborator seams for persistence, user profiles, and authentication.
//!
//! The engine never talks to a database directly; it goes through these
//! traits. The in-memory implementations back the default server binary and
//! the test suites.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::call::CallSnapshot;
use crate::message::{Message, Reaction};
use crate::{CallId, ChatId, MessageId, UserId};

/// A collaborator was unreachable or failed mid-operation.
#[derive(Debug, Error)]
#[error("store unavailable: {0}")]
pub struct StoreError(pub String);

/// Persistence for calls and their rosters.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Persist a call together with its full participant roster.
    async fn save_call(&self, snapshot: &CallSnapshot) -> Result<(), StoreError>;

    /// Load a call and roster by id.
    async fn load_call(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError>;
}

/// Persistence for messages, reactions, and chat membership lookups.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn load_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Add a reaction. Returns `None` for an unknown message, `Some(false)`
    /// when the same (user, emoji) reaction already exists.
    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<bool>, StoreError>;

    /// Remove a reaction. Returns `None` for an unknown message,
    /// `Some(false)` when there was nothing to remove.
    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<bool>, StoreError>;

    /// Whether the user is a participant of the chat.
    async fn is_chat_member(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError>;
}

/// User profile writes driven by presence transitions.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), StoreError>;

    async fn set_last_seen(&self, user_id: &str, at_millis: u64) -> Result<(), StoreError>;
}

/// Resolves a connection token to the caller's user identity.
///
/// The resolved identity is the only one the engine trusts; identities in
/// client-supplied parameters are ignored.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, StoreError>;
}

/// In-memory call store.
#[derive(Debug, Default)]
pub struct MemoryCallStore {
    calls: DashMap<CallId, CallSnapshot>,
}

impl MemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn save_call(&self, snapshot: &CallSnapshot) -> Result<(), StoreError> {
        self.calls
            .insert(snapshot.call.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_call(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        Ok(self.calls.get(call_id).map(|s| s.clone()))
    }
}

/// In-memory message store.
///
/// Chat membership is explicit via [`MemoryMessageStore::add_chat_member`],
/// or wide open with [`MemoryMessageStore::open`] for development setups
/// where every user belongs to every chat.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: DashMap<MessageId, Message>,
    reactions: DashMap<MessageId, Vec<Reaction>>,
    members: DashMap<ChatId, DashSet<UserId>>,
    open_membership: bool,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that treats every user as a member of every chat.
    #[must_use]
    pub fn open() -> Self {
        Self {
            open_membership: true,
            ..Self::default()
        }
    }

    pub fn add_chat_member(&self, chat_id: &str, user_id: &str) {
        self.members
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn load_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(message_id).map(|m| m.clone()))
    }

    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<bool>, StoreError> {
        if !self.messages.contains_key(message_id) {
            return Ok(None);
        }
        let mut reactions = self.reactions.entry(message_id.to_string()).or_default();
        if reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            return Ok(Some(false));
        }
        reactions.push(Reaction::new(user_id, emoji));
        Ok(Some(true))
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<bool>, StoreError> {
        if !self.messages.contains_key(message_id) {
            return Ok(None);
        }
        let Some(mut reactions) = self.reactions.get_mut(message_id) else {
            return Ok(Some(false));
        };
        let before = reactions.len();
        reactions.retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        Ok(Some(reactions.len() != before))
    }

    async fn is_chat_member(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError> {
        if self.open_membership {
            return Ok(true);
        }
        Ok(self
            .members
            .get(chat_id)
            .map(|set| set.contains(user_id))
            .unwrap_or(false))
    }
}

/// In-memory user profile store.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    online: DashMap<UserId, bool>,
    last_seen: DashMap<UserId, u64>,
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_seen(&self, user_id: &str) -> Option<u64> {
        self.last_seen.get(user_id).map(|v| *v)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), StoreError> {
        self.online.insert(user_id.to_string(), online);
        Ok(())
    }

    async fn set_last_seen(&self, user_id: &str, at_millis: u64) -> Result<(), StoreError> {
        self.last_seen.insert(user_id.to_string(), at_millis);
        Ok(())
    }
}

/// Development authenticator: the token is the user id.
///
/// Not for production; real deployments supply an [`Authenticator`] backed
/// by their session system.
#[derive(Debug, Default)]
pub struct InsecureAuthenticator;

#[async_trait]
impl Authenticator for InsecureAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::MessageKind;

    #[tokio::test]
    async fn reactions_are_deduplicated() {
        let store = MemoryMessageStore::new();
        let message = Message::new("chat-1", "alice", "hi", MessageKind::Text);
        store.save_message(&message).await.unwrap();

        assert_eq!(
            store.add_reaction(&message.id, "bob", "👍").await.unwrap(),
            Some(true)
        );
        assert_eq!(
            store.add_reaction(&message.id, "bob", "👍").await.unwrap(),
            Some(false)
        );
        assert_eq!(
            store
                .remove_reaction(&message.id, "bob", "👍")
                .await
                .unwrap(),
            Some(true)
        );
        assert_eq!(
            store
                .remove_reaction(&message.id, "bob", "👍")
                .await
                .unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn reaction_on_unknown_message_is_none() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.add_reaction("nope", "bob", "👍").await.unwrap(), None);
    }

    #[tokio::test]
    async fn membership_checks() {
        let store = MemoryMessageStore::new();
        store.add_chat_member("chat-1", "alice");

        assert!(store.is_chat_member("chat-1", "alice").await.unwrap());
        assert!(!store.is_chat_member("chat-1", "bob").await.unwrap());

        let open = MemoryMessageStore::open();
        assert!(open.is_chat_member("chat-1", "anyone").await.unwrap());
    }

    #[tokio::test]
    async fn insecure_authenticator_passes_token_through() {
        let auth = InsecureAuthenticator;
        assert_eq!(
            auth.authenticate("alice").await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(auth.authenticate("   ").await.unwrap(), None);
    }
}
