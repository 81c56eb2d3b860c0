//! Message delivery and read receipts.
//!
//! Per message, two monotonically growing sets of user ids and their
//! derived counts. Inserts are idempotent and commutative; delivered and
//! read are independent (a client may mark read without ever marking
//! delivered). The sender is never a member of their own sets.

use dashmap::{DashMap, DashSet};
use tracing::trace;

use crate::{MessageId, UserId};

/// Derived receipt counts for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiptCounts {
    pub delivered: usize,
    pub read: usize,
}

#[derive(Debug, Default)]
struct ReceiptEntry {
    sender: UserId,
    delivered: DashSet<UserId>,
    read: DashSet<UserId>,
}

/// Tracks delivered/read receipts per message.
#[derive(Debug, Default)]
pub struct MessageDeliveryTracker {
    receipts: DashMap<MessageId, ReceiptEntry>,
}

impl MessageDeliveryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user_id` received the message.
    ///
    /// Returns `true` if the set grew; `false` for the sender's own id or a
    /// repeated mark.
    pub fn mark_delivered(&self, message_id: &str, sender_id: &str, user_id: &str) -> bool {
        self.mark(message_id, sender_id, user_id, Set::Delivered)
    }

    /// Record that `user_id` read the message. Same idempotence rules as
    /// [`Self::mark_delivered`].
    pub fn mark_read(&self, message_id: &str, sender_id: &str, user_id: &str) -> bool {
        self.mark(message_id, sender_id, user_id, Set::Read)
    }

    /// Current counts for a message; zero for untracked messages.
    #[must_use]
    pub fn counts(&self, message_id: &str) -> ReceiptCounts {
        self.receipts
            .get(message_id)
            .map(|entry| ReceiptCounts {
                delivered: entry.delivered.len(),
                read: entry.read.len(),
            })
            .unwrap_or_default()
    }

    /// Users the message was delivered to.
    #[must_use]
    pub fn delivered_to(&self, message_id: &str) -> Vec<UserId> {
        self.receipts
            .get(message_id)
            .map(|e| e.delivered.iter().map(|u| u.clone()).collect())
            .unwrap_or_default()
    }

    /// Users who read the message.
    #[must_use]
    pub fn read_by(&self, message_id: &str) -> Vec<UserId> {
        self.receipts
            .get(message_id)
            .map(|e| e.read.iter().map(|u| u.clone()).collect())
            .unwrap_or_default()
    }

    fn mark(&self, message_id: &str, sender_id: &str, user_id: &str, set: Set) -> bool {
        // A user cannot deliver or read their own message.
        if user_id == sender_id {
            return false;
        }

        let entry = self
            .receipts
            .entry(message_id.to_string())
            .or_insert_with(|| ReceiptEntry {
                sender: sender_id.to_string(),
                ..ReceiptEntry::default()
            });
        if entry.sender == user_id {
            return false;
        }

        let inserted = match set {
            Set::Delivered => entry.delivered.insert(user_id.to_string()),
            Set::Read => entry.read.insert(user_id.to_string()),
        };
        if inserted {
            trace!(message = %message_id, user = %user_id, ?set, "Receipt recorded");
        }
        inserted
    }
}

#[derive(Debug, Clone, Copy)]
enum Set {
    Delivered,
    Read,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_idempotent() {
        let tracker = MessageDeliveryTracker::new();

        assert!(tracker.mark_read("msg-1", "alice", "bob"));
        assert!(!tracker.mark_read("msg-1", "alice", "bob"));
        assert_eq!(tracker.counts("msg-1").read, 1);

        assert!(tracker.mark_delivered("msg-1", "alice", "bob"));
        assert!(!tracker.mark_delivered("msg-1", "alice", "bob"));
        assert_eq!(
            tracker.counts("msg-1"),
            ReceiptCounts {
                delivered: 1,
                read: 1
            }
        );
    }

    #[test]
    fn sender_is_excluded_from_own_receipts() {
        let tracker = MessageDeliveryTracker::new();

        assert!(!tracker.mark_delivered("msg-1", "alice", "alice"));
        assert!(!tracker.mark_read("msg-1", "alice", "alice"));
        assert_eq!(tracker.counts("msg-1"), ReceiptCounts::default());
    }

    #[test]
    fn read_does_not_require_delivered() {
        let tracker = MessageDeliveryTracker::new();

        assert!(tracker.mark_read("msg-1", "alice", "bob"));
        assert_eq!(tracker.counts("msg-1").delivered, 0);
        assert_eq!(tracker.counts("msg-1").read, 1);
    }

    #[test]
    fn sets_only_grow() {
        let tracker = MessageDeliveryTracker::new();
        for user in ["bob", "carol", "dave"] {
            tracker.mark_read("msg-1", "alice", user);
        }
        // Replays change nothing.
        for user in ["bob", "carol", "dave"] {
            tracker.mark_read("msg-1", "alice", user);
        }
        assert_eq!(tracker.counts("msg-1").read, 3);
        assert_eq!(tracker.read_by("msg-1").len(), 3);
    }

    #[test]
    fn untracked_message_counts_are_zero() {
        let tracker = MessageDeliveryTracker::new();
        assert_eq!(tracker.counts("nope"), ReceiptCounts::default());
        assert!(tracker.delivered_to("nope").is_empty());
    }
}
