//! Process-wide connection registry.
//!
//! Maps transport connections to user identities and derives presence from
//! them: a user is online iff at least one live connection maps to them.
//! State is ephemeral; after a restart every user is offline until they
//! reconnect.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::{ConnectionId, UserId};

/// Registry of live transport connections.
///
/// All operations are atomic with respect to each other per user: a register
/// and an unregister racing for the same user cannot both claim the
/// first/last-connection transition.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Connection identity to user identity.
    connections: DashMap<ConnectionId, UserId>,
    /// User identity to the set of their live connections.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user.
    ///
    /// Returns `true` if this is the user's first live connection.
    /// Re-registering the same connection id is a no-op returning `false`.
    pub fn register(&self, connection_id: &str, user_id: &str) -> bool {
        let previous = self
            .connections
            .insert(connection_id.to_string(), user_id.to_string());
        match previous.as_deref() {
            Some(prev) if prev == user_id => return false,
            // Rebinding a connection to another user releases it from the
            // old user's set so they cannot stay online through it.
            Some(prev) => {
                if let Entry::Occupied(mut entry) = self.users.entry(prev.to_string()) {
                    entry.get_mut().remove(connection_id);
                    if entry.get().is_empty() {
                        entry.remove();
                    }
                }
            }
            None => {}
        }

        let mut entry = self.users.entry(user_id.to_string()).or_default();
        entry.insert(connection_id.to_string());
        let first = entry.len() == 1;
        drop(entry);

        debug!(connection = %connection_id, user = %user_id, first, "Connection registered");
        first
    }

    /// Remove a connection by its identity.
    ///
    /// Returns the user it belonged to and whether the user now has zero
    /// remaining connections. Unknown connection ids return `None`.
    pub fn unregister(&self, connection_id: &str) -> Option<(UserId, bool)> {
        let (_, user_id) = self.connections.remove(connection_id)?;

        let mut last = false;
        if let Entry::Occupied(mut entry) = self.users.entry(user_id.clone()) {
            entry.get_mut().remove(connection_id);
            if entry.get().is_empty() {
                entry.remove();
                last = true;
            }
        }

        debug!(connection = %connection_id, user = %user_id, last, "Connection unregistered");
        Some((user_id, last))
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// The user a connection belongs to.
    #[must_use]
    pub fn user_of(&self, connection_id: &str) -> Option<UserId> {
        self.connections.get(connection_id).map(|u| u.clone())
    }

    /// All live connections of a user.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
