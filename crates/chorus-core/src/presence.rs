//! Presence transitions.
//!
//! Turns connection-registry transitions (first connection up, last
//! connection down) into `UserStatusChanged` broadcasts and user-profile
//! writes. The profile write is fire-and-forget: a slow or failing store
//! never delays or suppresses the broadcast.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::GroupBus;
use crate::clock;
use crate::events::ServerEvent;
use crate::store::ProfileStore;

/// Publishes presence changes derived from registry transitions.
pub struct PresenceBroadcaster {
    bus: Arc<GroupBus>,
    profiles: Arc<dyn ProfileStore>,
}

impl PresenceBroadcaster {
    #[must_use]
    pub fn new(bus: Arc<GroupBus>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { bus, profiles }
    }

    /// Handle a registered connection. Broadcasts `online` on the user's
    /// first live connection; later connections are silent.
    pub fn connection_opened(&self, user_id: &str, first_connection: bool) {
        if !first_connection {
            return;
        }

        self.bus.publish_to_all(ServerEvent::UserStatusChanged {
            user_id: user_id.to_string(),
            online: true,
        });
        debug!(user = %user_id, "User online");

        let profiles = Arc::clone(&self.profiles);
        let user = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = profiles.set_online(&user, true).await {
                warn!(user = %user, error = %e, "Profile online write failed");
            }
        });
    }

    /// Handle an unregistered connection. Broadcasts `offline` and records
    /// last-seen when the user's final connection dropped.
    pub fn connection_closed(&self, user_id: &str, last_connection: bool) {
        if !last_connection {
            return;
        }

        self.bus.publish_to_all(ServerEvent::UserStatusChanged {
            user_id: user_id.to_string(),
            online: false,
        });
        debug!(user = %user_id, "User offline");

        let profiles = Arc::clone(&self.profiles);
        let user = user_id.to_string();
        let now = clock::now_millis();
        tokio::spawn(async move {
            if let Err(e) = profiles.set_online(&user, false).await {
                warn!(user = %user, error = %e, "Profile offline write failed");
            }
            if let Err(e) = profiles.set_last_seen(&user, now).await {
                warn!(user = %user, error = %e, "Last-seen write failed");
            }
        });
    }
}
