//! Media-negotiation signaling relay.
//!
//! Stateless pass-through of offer/answer/candidate payloads from one user
//! to one specifically addressed user. Payload contents are never inspected
//! beyond size checks; delivery goes only to the target's live connections,
//! and an offline target simply receives nothing.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::bus::GroupBus;
use crate::error::EngineError;
use crate::events::ServerEvent;

/// Default cap on a single signaling payload.
pub const DEFAULT_MAX_SIGNAL_PAYLOAD: usize = 64 * 1024;

/// The three relayed payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Forwards opaque negotiation payloads between two users.
pub struct SignalingRelay {
    bus: Arc<GroupBus>,
    max_payload_bytes: usize,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(bus: Arc<GroupBus>) -> Self {
        Self::with_max_payload(bus, DEFAULT_MAX_SIGNAL_PAYLOAD)
    }

    #[must_use]
    pub fn with_max_payload(bus: Arc<GroupBus>, max_payload_bytes: usize) -> Self {
        Self {
            bus,
            max_payload_bytes,
        }
    }

    /// Relay a payload to the addressed user's current connections.
    ///
    /// `from_user_id` must be the caller's resolved identity, never taken
    /// from the payload. Returns the number of connections reached; zero
    /// (target offline) is success.
    ///
    /// # Errors
    ///
    /// `Payload` if the payload is empty or exceeds the configured cap.
    pub fn relay(
        &self,
        kind: SignalKind,
        call_id: &str,
        from_user_id: &str,
        target_user_id: &str,
        payload: Vec<u8>,
    ) -> Result<usize, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::Payload("empty signaling payload".into()));
        }
        if payload.len() > self.max_payload_bytes {
            return Err(EngineError::Payload(format!(
                "signaling payload of {} bytes exceeds cap of {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let event = match kind {
            SignalKind::Offer => ServerEvent::ReceiveOffer {
                call_id: call_id.to_string(),
                from_user_id: from_user_id.to_string(),
                payload,
            },
            SignalKind::Answer => ServerEvent::ReceiveAnswer {
                call_id: call_id.to_string(),
                from_user_id: from_user_id.to_string(),
                payload,
            },
            SignalKind::IceCandidate => ServerEvent::ReceiveIceCandidate {
                call_id: call_id.to_string(),
                from_user_id: from_user_id.to_string(),
                payload,
            },
        };

        let delivered = self.bus.publish_to_user(target_user_id, event);
        if delivered == 0 {
            debug!(
                call = %call_id,
                target = %target_user_id,
                ?kind,
                "Signal dropped; target offline"
            );
        } else {
            trace!(call = %call_id, target = %target_user_id, ?kind, delivered, "Signal relayed");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<GroupBus>, SignalingRelay) {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(GroupBus::new(Arc::clone(&registry)));
        let relay = SignalingRelay::with_max_payload(Arc::clone(&bus), 128);
        (registry, bus, relay)
    }

    #[test]
    fn relays_only_to_the_addressed_user() {
        let (registry, bus, relay) = setup();
        registry.register("conn-a", "alice");
        registry.register("conn-b", "bob");
        let mut rx_a = bus.attach("conn-a");
        let mut rx_b = bus.attach("conn-b");

        let delivered = relay
            .relay(SignalKind::Offer, "call-1", "alice", "bob", b"sdp".to_vec())
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        let event = rx_b.try_recv().unwrap();
        match event.as_ref() {
            ServerEvent::ReceiveOffer { from_user_id, .. } => {
                assert_eq!(from_user_id, "alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn offline_target_is_dropped_without_error() {
        let (_, _, relay) = setup();
        let delivered = relay
            .relay(
                SignalKind::Answer,
                "call-1",
                "alice",
                "ghost",
                b"sdp".to_vec(),
            )
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn empty_and_oversized_payloads_are_rejected() {
        let (_, _, relay) = setup();

        assert!(matches!(
            relay.relay(SignalKind::IceCandidate, "call-1", "a", "b", Vec::new()),
            Err(EngineError::Payload(_))
        ));
        assert!(matches!(
            relay.relay(SignalKind::Offer, "call-1", "a", "b", vec![0u8; 129]),
            Err(EngineError::Payload(_))
        ));
    }

    #[test]
    fn payload_bytes_pass_through_unmodified() {
        let (registry, bus, relay) = setup();
        registry.register("conn-b", "bob");
        let mut rx = bus.attach("conn-b");

        // Arbitrary bytes, not valid SDP or JSON; the relay must not care.
        let blob = vec![0xff, 0x00, 0x7f, 0x80];
        relay
            .relay(SignalKind::IceCandidate, "call-1", "alice", "bob", blob.clone())
            .unwrap();

        match rx.try_recv().unwrap().as_ref() {
            ServerEvent::ReceiveIceCandidate { payload, .. } => assert_eq!(payload, &blob),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
