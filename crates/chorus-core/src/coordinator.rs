//! Call orchestration.
//!
//! Thin layer between the connection handlers and the state machine: run
//! the mutation, re-read the resulting call so concurrent roster changes are
//! reflected, then publish exactly one event to the chat's broadcast group.
//! When the state machine reports failure nothing is published; the denial
//! goes back to the caller alone.

use std::sync::Arc;

use tracing::warn;

use crate::bus::GroupBus;
use crate::call::{CallSnapshot, CallStateMachine};
use crate::error::EngineError;
use crate::events::ServerEvent;

use chorus_protocol::CallKind;

/// Orchestrates call actions and their broadcasts.
pub struct CallCoordinator {
    calls: Arc<CallStateMachine>,
    bus: Arc<GroupBus>,
}

impl CallCoordinator {
    #[must_use]
    pub fn new(calls: Arc<CallStateMachine>, bus: Arc<GroupBus>) -> Self {
        Self { calls, bus }
    }

    /// Start a call and announce it (with roster) to the chat group.
    ///
    /// # Errors
    ///
    /// Propagates `Conflict` / `Transient` from the state machine.
    pub async fn start_call(
        &self,
        chat_id: &str,
        initiator_id: &str,
        kind: CallKind,
    ) -> Result<CallSnapshot, EngineError> {
        let snapshot = self.calls.start_call(chat_id, initiator_id, kind).await?;
        // Re-read in case someone joined between persist and publish.
        let snapshot = self
            .calls
            .snapshot(&snapshot.call.id)
            .await
            .unwrap_or(snapshot);

        self.bus.publish_to_group(
            chat_id,
            ServerEvent::CallStarted {
                call: snapshot.call.clone(),
                participants: snapshot.participants.clone(),
            },
            &[],
        );
        Ok(snapshot)
    }

    /// Join a call and announce the new roster to the chat group.
    ///
    /// # Errors
    ///
    /// `NotFound` if the call is unknown or no longer joinable.
    pub async fn join_call(&self, call_id: &str, user_id: &str) -> Result<(), EngineError> {
        self.calls.join_call(call_id, user_id).await?;

        let snapshot = self
            .calls
            .snapshot(call_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("call {call_id}")))?;
        self.bus.publish_to_group(
            &snapshot.call.chat_id,
            ServerEvent::CallParticipantJoined {
                call_id: call_id.to_string(),
                user_id: user_id.to_string(),
                participants: snapshot.participants,
            },
            &[],
        );
        Ok(())
    }

    /// Leave a call. Returns `false` when the user was not an active
    /// participant (nothing published).
    ///
    /// # Errors
    ///
    /// `Transient` on persistence failure.
    pub async fn leave_call(&self, call_id: &str, user_id: &str) -> Result<bool, EngineError> {
        let Some(outcome) = self.calls.leave_call(call_id, user_id).await? else {
            return Ok(false);
        };

        self.bus.publish_to_group(
            &outcome.snapshot.call.chat_id,
            ServerEvent::CallParticipantLeft {
                call_id: call_id.to_string(),
                user_id: user_id.to_string(),
                ended: outcome.ended,
            },
            &[],
        );
        Ok(true)
    }

    /// Force-end a call. Returns `false` when the call had already ended.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call; `Transient` on persistence failure.
    pub async fn end_call(&self, call_id: &str) -> Result<bool, EngineError> {
        let Some(snapshot) = self.calls.end_call(call_id).await? else {
            return Ok(false);
        };

        self.bus.publish_to_group(
            &snapshot.call.chat_id,
            ServerEvent::CallEnded {
                call_id: call_id.to_string(),
                duration_secs: snapshot.call.duration_secs,
            },
            &[],
        );
        Ok(true)
    }

    /// Toggle the caller's mute flag, broadcasting the new value.
    pub async fn toggle_mute(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        let Some(muted) = self.calls.toggle_mute(call_id, user_id).await? else {
            return Ok(None);
        };
        self.publish_for_call(call_id, |call_id| ServerEvent::ParticipantMuted {
            call_id,
            user_id: user_id.to_string(),
            muted,
        })
        .await;
        Ok(Some(muted))
    }

    /// Toggle the caller's video flag, broadcasting the new value.
    pub async fn toggle_video(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        let Some(video_enabled) = self.calls.toggle_video(call_id, user_id).await? else {
            return Ok(None);
        };
        self.publish_for_call(call_id, |call_id| ServerEvent::ParticipantVideoToggled {
            call_id,
            user_id: user_id.to_string(),
            video_enabled,
        })
        .await;
        Ok(Some(video_enabled))
    }

    /// Toggle the caller's screen-share flag, broadcasting the new value.
    pub async fn toggle_screen_share(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        let Some(screen_sharing) = self.calls.toggle_screen_share(call_id, user_id).await? else {
            return Ok(None);
        };
        self.publish_for_call(call_id, |call_id| {
            ServerEvent::ParticipantScreenShareToggled {
                call_id,
                user_id: user_id.to_string(),
                screen_sharing,
            }
        })
        .await;
        Ok(Some(screen_sharing))
    }

    /// Leave every call the user is still active in; used by disconnect
    /// cleanup. Funnels through the same idempotent leave path as explicit
    /// leaves, so a racing explicit leave causes no double effect.
    pub async fn leave_all(&self, user_id: &str) {
        for call_id in self.calls.calls_of(user_id) {
            if let Err(e) = self.leave_call(&call_id, user_id).await {
                warn!(call = %call_id, user = %user_id, error = %e, "Disconnect cleanup leave failed");
            }
        }
    }

    async fn publish_for_call(
        &self,
        call_id: &str,
        build: impl FnOnce(String) -> ServerEvent,
    ) {
        if let Some(snapshot) = self.calls.snapshot(call_id).await {
            self.bus.publish_to_group(
                &snapshot.call.chat_id,
                build(call_id.to_string()),
                &[],
            );
        }
    }
}
