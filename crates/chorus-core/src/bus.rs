//! Group broadcast bus.
//!
//! The fan-out primitive behind every realtime event: publish to all members
//! of a named group (a chat), to every connection of one addressed user, or
//! to every attached connection. Delivery is best-effort to currently
//! connected members; there is no backlog or replay.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::events::ServerEvent;
use crate::registry::ConnectionRegistry;
use crate::{ConnectionId, GroupId};

/// Maximum group name length.
pub const MAX_GROUP_NAME_LENGTH: usize = 256;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid group name.
    #[error("Invalid group name: {0}")]
    InvalidGroup(&'static str),

    /// Connection is already a member of the group.
    #[error("Already joined group: {0}")]
    AlreadyJoined(String),

    /// Maximum group memberships reached for this connection.
    #[error("Maximum group memberships reached")]
    MaxGroupsReached,
}

/// Validate a group name.
///
/// # Errors
///
/// Returns a reason if the name is unusable.
pub fn validate_group_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Group name cannot be empty");
    }
    if name.len() > MAX_GROUP_NAME_LENGTH {
        return Err("Group name too long");
    }
    if name.starts_with('$') {
        return Err("Group names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Group name contains invalid characters");
    }
    Ok(())
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum group memberships per connection.
    pub max_groups_per_connection: usize,
    /// Broadcast capacity per group.
    pub group_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_groups_per_connection: 100,
            group_capacity: 1024,
        }
    }
}

/// An event published to a group, with connections to skip.
///
/// Exclusion is applied receiver-side: a connection task drops deliveries
/// whose exclude set names its own connection id.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Arc<ServerEvent>,
    pub exclude: Vec<ConnectionId>,
}

impl Delivery {
    /// Whether the delivery should be dropped for a connection.
    #[must_use]
    pub fn excludes(&self, connection_id: &str) -> bool {
        self.exclude.iter().any(|c| c == connection_id)
    }
}

struct GroupEntry {
    sender: broadcast::Sender<Arc<Delivery>>,
    members: DashSet<ConnectionId>,
}

impl GroupEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: DashSet::new(),
        }
    }
}

/// The process-wide broadcast bus.
pub struct GroupBus {
    /// Groups indexed by name; created on first join, dropped when empty.
    groups: DashMap<GroupId, GroupEntry>,
    /// Group memberships per connection.
    memberships: DashMap<ConnectionId, DashSet<GroupId>>,
    /// Direct per-connection lane for targeted and global delivery.
    direct: DashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>,
    registry: Arc<ConnectionRegistry>,
    config: BusConfig,
}

impl GroupBus {
    /// Create a bus with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, BusConfig::default())
    }

    /// Create a bus with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: BusConfig) -> Self {
        Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            direct: DashMap::new(),
            registry,
            config,
        }
    }

    /// Open the direct delivery lane for a connection.
    ///
    /// The returned receiver carries targeted (per-user) and global events.
    pub fn attach(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Arc<ServerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.direct.insert(connection_id.to_string(), tx);
        debug!(connection = %connection_id, "Connection attached to bus");
        rx
    }

    /// Close the direct lane and leave all groups.
    pub fn detach(&self, connection_id: &str) {
        self.direct.remove(connection_id);
        self.leave_all(connection_id);
        debug!(connection = %connection_id, "Connection detached from bus");
    }

    /// Add a connection to a group.
    ///
    /// Returns a receiver for deliveries published to the group.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names, duplicate joins, or exceeded
    /// membership limits.
    pub fn join_group(
        &self,
        connection_id: &str,
        group_id: &str,
    ) -> Result<broadcast::Receiver<Arc<Delivery>>, BusError> {
        validate_group_name(group_id).map_err(BusError::InvalidGroup)?;

        let conn_groups = self
            .memberships
            .entry(connection_id.to_string())
            .or_default();
        if conn_groups.len() >= self.config.max_groups_per_connection {
            return Err(BusError::MaxGroupsReached);
        }
        if conn_groups.contains(group_id) {
            return Err(BusError::AlreadyJoined(group_id.to_string()));
        }

        let entry = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| {
                debug!(group = %group_id, "Creating group");
                GroupEntry::new(self.config.group_capacity)
            });

        let receiver = entry.sender.subscribe();
        entry.members.insert(connection_id.to_string());
        conn_groups.insert(group_id.to_string());

        debug!(
            group = %group_id,
            connection = %connection_id,
            members = entry.members.len(),
            "Joined group"
        );
        Ok(receiver)
    }

    /// Remove a connection from a group.
    ///
    /// Returns `false` if the connection was not a member.
    pub fn leave_group(&self, connection_id: &str, group_id: &str) -> bool {
        let removed = self
            .memberships
            .get(connection_id)
            .map(|groups| groups.remove(group_id).is_some())
            .unwrap_or(false);
        if !removed {
            return false;
        }

        if let Some(entry) = self.groups.get(group_id) {
            entry.members.remove(connection_id);
            let empty = entry.members.is_empty();
            drop(entry);
            if empty {
                self.groups.remove_if(group_id, |_, e| e.members.is_empty());
                debug!(group = %group_id, "Deleted empty group");
            }
        }

        debug!(group = %group_id, connection = %connection_id, "Left group");
        true
    }

    /// Remove a connection from every group it joined.
    pub fn leave_all(&self, connection_id: &str) {
        if let Some((_, groups)) = self.memberships.remove(connection_id) {
            for group_id in groups.iter() {
                if let Some(entry) = self.groups.get(group_id.key()) {
                    entry.members.remove(connection_id);
                    let empty = entry.members.is_empty();
                    drop(entry);
                    if empty {
                        let name = group_id.key().clone();
                        self.groups.remove_if(&name, |_, e| e.members.is_empty());
                    }
                }
            }
        }
    }

    /// Publish an event to every member of a group, minus the exclusions.
    ///
    /// Returns the number of receivers the event was handed to.
    pub fn publish_to_group(
        &self,
        group_id: &str,
        event: ServerEvent,
        exclude: &[ConnectionId],
    ) -> usize {
        let Some(entry) = self.groups.get(group_id) else {
            trace!(group = %group_id, "Publish to non-existent group");
            return 0;
        };

        let delivery = Arc::new(Delivery {
            event: Arc::new(event),
            exclude: exclude.to_vec(),
        });
        let count = entry.sender.send(delivery).unwrap_or_default();
        trace!(group = %group_id, recipients = count, "Published to group");
        count
    }

    /// Deliver an event to every live connection of one user.
    ///
    /// Offline targets receive nothing; that is not an error.
    pub fn publish_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for connection_id in self.registry.connections_of(user_id) {
            if let Some(tx) = self.direct.get(&connection_id) {
                if tx.send(Arc::clone(&event)).is_ok() {
                    delivered += 1;
                } else {
                    warn!(connection = %connection_id, "Direct lane closed");
                }
            }
        }
        trace!(user = %user_id, delivered, "Published to user");
        delivered
    }

    /// Deliver an event to every attached connection.
    pub fn publish_to_all(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for entry in self.direct.iter() {
            if entry.value().send(Arc::clone(&event)).is_ok() {
                delivered += 1;
            }
        }
        trace!(delivered, "Published to all connections");
        delivered
    }

    /// Whether a group currently exists.
    #[must_use]
    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Number of members in a group.
    #[must_use]
    pub fn member_count(&self, group_id: &str) -> usize {
        self.groups
            .get(group_id)
            .map(|e| e.members.len())
            .unwrap_or(0)
    }

    /// Bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            group_count: self.groups.len(),
            attached_connections: self.direct.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    pub group_count: usize,
    pub attached_connections: usize,
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (Arc<ConnectionRegistry>, GroupBus) {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = GroupBus::new(Arc::clone(&registry));
        (registry, bus)
    }

    fn typing(chat: &str, user: &str) -> ServerEvent {
        ServerEvent::UserTyping {
            chat_id: chat.into(),
            user_id: user.into(),
        }
    }

    #[test]
    fn join_publish_leave() {
        let (_, bus) = bus();

        let mut rx = bus.join_group("conn-1", "chat-1").unwrap();
        assert!(bus.group_exists("chat-1"));
        assert_eq!(bus.member_count("chat-1"), 1);

        let count = bus.publish_to_group("chat-1", typing("chat-1", "alice"), &[]);
        assert_eq!(count, 1);
        assert!(rx.try_recv().is_ok());

        assert!(bus.leave_group("conn-1", "chat-1"));
        assert!(!bus.group_exists("chat-1"));
        assert!(!bus.leave_group("conn-1", "chat-1"));
    }

    #[test]
    fn duplicate_join_is_rejected() {
        let (_, bus) = bus();
        let _rx = bus.join_group("conn-1", "chat-1").unwrap();
        assert!(matches!(
            bus.join_group("conn-1", "chat-1"),
            Err(BusError::AlreadyJoined(_))
        ));
    }

    #[test]
    fn invalid_group_names_are_rejected() {
        let (_, bus) = bus();
        assert!(bus.join_group("conn-1", "").is_err());
        assert!(bus.join_group("conn-1", "$system").is_err());
    }

    #[test]
    fn exclusions_are_visible_to_receivers() {
        let (_, bus) = bus();
        let mut rx1 = bus.join_group("conn-1", "chat-1").unwrap();
        let mut rx2 = bus.join_group("conn-2", "chat-1").unwrap();

        bus.publish_to_group(
            "chat-1",
            typing("chat-1", "alice"),
            &["conn-1".to_string()],
        );

        let d1 = rx1.try_recv().unwrap();
        let d2 = rx2.try_recv().unwrap();
        assert!(d1.excludes("conn-1"));
        assert!(!d2.excludes("conn-2"));
    }

    #[test]
    fn publish_to_user_reaches_all_their_connections_only() {
        let (registry, bus) = bus();
        registry.register("conn-1", "alice");
        registry.register("conn-2", "alice");
        registry.register("conn-3", "bob");

        let mut rx1 = bus.attach("conn-1");
        let mut rx2 = bus.attach("conn-2");
        let mut rx3 = bus.attach("conn-3");

        let delivered = bus.publish_to_user(
            "alice",
            ServerEvent::ReceiveOffer {
                call_id: "call-1".into(),
                from_user_id: "bob".into(),
                payload: vec![1],
            },
        );
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn publish_to_offline_user_delivers_nothing() {
        let (_, bus) = bus();
        let delivered = bus.publish_to_user("ghost", typing("chat-1", "ghost"));
        assert_eq!(delivered, 0);
    }

    #[test]
    fn publish_to_all_reaches_every_attached_connection() {
        let (_, bus) = bus();
        let mut rx1 = bus.attach("conn-1");
        let mut rx2 = bus.attach("conn-2");

        let delivered = bus.publish_to_all(ServerEvent::UserStatusChanged {
            user_id: "alice".into(),
            online: true,
        });
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn detach_leaves_all_groups() {
        let (_, bus) = bus();
        let _rx = bus.attach("conn-1");
        let _g1 = bus.join_group("conn-1", "chat-1").unwrap();
        let _g2 = bus.join_group("conn-1", "chat-2").unwrap();

        bus.detach("conn-1");
        assert!(!bus.group_exists("chat-1"));
        assert!(!bus.group_exists("chat-2"));
        assert_eq!(bus.stats().attached_connections, 0);
    }
}
