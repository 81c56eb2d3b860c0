//! Call lifecycle state machine.
//!
//! Owns the `Call` and `CallParticipant` aggregates. Every mutating
//! operation runs inside a per-call critical section (a `tokio::sync::Mutex`
//! keyed by call id) and is written through the [`CallStore`] collaborator
//! before the new state becomes observable, so a broadcast can never race
//! ahead of what a client can read back.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use chorus_protocol::CallKind;

use crate::clock;
use crate::error::EngineError;
use crate::store::CallStore;
use crate::{CallId, ChatId, UserId};

/// Lifecycle status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    InProgress,
    Ended,
    // Terminal outcomes for unanswered calls. Modeled for history rows but
    // not yet produced by the join/leave/end flows; explicit reject/cancel
    // and timeout-to-missed transitions are unwired.
    Missed,
    Rejected,
    Cancelled,
}

impl CallStatus {
    /// Whether a call in this status still accepts participants.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, CallStatus::Ringing | CallStatus::InProgress)
    }
}

/// A voice/video/audio-room session scoped to one chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub chat_id: ChatId,
    pub initiator_id: UserId,
    pub kind: CallKind,
    pub status: CallStatus,
    /// Milliseconds since the Unix epoch.
    pub started_at: u64,
    pub ended_at: Option<u64>,
    /// Seconds between start and end; set only when the call ends.
    pub duration_secs: Option<u64>,
}

/// One user's membership in a call. Active while `left_at` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParticipant {
    pub id: String,
    pub call_id: CallId,
    pub user_id: UserId,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub joined_at: u64,
    pub left_at: Option<u64>,
}

impl CallParticipant {
    fn new(call_id: &str, user_id: &str, video_enabled: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
            muted: false,
            video_enabled,
            screen_sharing: false,
            joined_at: clock::now_millis(),
            left_at: None,
        }
    }

    /// Whether the participant is still in the call.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// A call together with its full participant roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call: Call,
    pub participants: Vec<CallParticipant>,
}

impl CallSnapshot {
    /// Participants that have not left.
    #[must_use]
    pub fn active_participants(&self) -> Vec<&CallParticipant> {
        self.participants.iter().filter(|p| p.is_active()).collect()
    }
}

/// Outcome of a successful leave.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    /// Whether this leave ended the call.
    pub ended: bool,
    pub snapshot: CallSnapshot,
}

#[derive(Debug, Clone)]
struct CallEntry {
    call: Call,
    participants: Vec<CallParticipant>,
}

impl CallEntry {
    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call: self.call.clone(),
            participants: self.participants.clone(),
        }
    }

    fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active()).count()
    }

    fn active_index(&self, user_id: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.user_id == user_id && p.is_active())
    }

    /// Transition to `Ended`, stamping end time and duration.
    fn finish(&mut self, now: u64) {
        self.call.status = CallStatus::Ended;
        self.call.ended_at = Some(now);
        self.call.duration_secs = Some(now.saturating_sub(self.call.started_at) / 1000);
    }
}

/// Serialized-per-call mutation API over the call aggregates.
pub struct CallStateMachine {
    calls: DashMap<CallId, Arc<Mutex<CallEntry>>>,
    /// Active (ringing or in-progress) call per chat. Creation serializes
    /// through this index, which enforces one active call per chat.
    by_chat: DashMap<ChatId, CallId>,
    /// Calls each user currently has an active participant record in, for
    /// disconnect cleanup.
    by_user: DashMap<UserId, DashSet<CallId>>,
    store: Arc<dyn CallStore>,
}

impl CallStateMachine {
    #[must_use]
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self {
            calls: DashMap::new(),
            by_chat: DashMap::new(),
            by_user: DashMap::new(),
            store,
        }
    }

    /// Start a call in a chat with the initiator as first participant.
    ///
    /// # Errors
    ///
    /// `Conflict` if the chat already has a ringing or in-progress call;
    /// `Transient` if persisting the new call fails.
    pub async fn start_call(
        &self,
        chat_id: &str,
        initiator_id: &str,
        kind: CallKind,
    ) -> Result<CallSnapshot, EngineError> {
        let call_id = Uuid::new_v4().to_string();

        // Reserve the chat's active-call slot first; the map entry is the
        // serialization point for racing starts.
        match self.by_chat.entry(chat_id.to_string()) {
            Entry::Occupied(existing) => {
                return Err(EngineError::Conflict(format!(
                    "chat {chat_id} already has active call {}",
                    existing.get()
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(call_id.clone());
            }
        }

        let call = Call {
            id: call_id.clone(),
            chat_id: chat_id.to_string(),
            initiator_id: initiator_id.to_string(),
            kind,
            status: CallStatus::Ringing,
            started_at: clock::now_millis(),
            ended_at: None,
            duration_secs: None,
        };
        let initiator = CallParticipant::new(&call_id, initiator_id, kind == CallKind::Video);
        let entry = CallEntry {
            call,
            participants: vec![initiator],
        };
        let snapshot = entry.snapshot();

        if let Err(e) = self.store.save_call(&snapshot).await {
            // Release the reservation so a retry can succeed.
            self.by_chat.remove_if(chat_id, |_, v| *v == call_id);
            return Err(EngineError::Transient(e.to_string()));
        }

        self.calls
            .insert(call_id.clone(), Arc::new(Mutex::new(entry)));
        self.attach_user(initiator_id, &call_id);

        info!(call = %call_id, chat = %chat_id, user = %initiator_id, ?kind, "Call started");
        Ok(snapshot)
    }

    /// Join a call, creating an active participant record.
    ///
    /// Joining a call the user is already active in succeeds as a no-op.
    /// The first join moves a ringing call to in-progress.
    ///
    /// # Errors
    ///
    /// `NotFound` if the call does not exist or is no longer joinable;
    /// `Transient` on persistence failure.
    pub async fn join_call(&self, call_id: &str, user_id: &str) -> Result<(), EngineError> {
        let entry = self
            .entry(call_id)
            .ok_or_else(|| EngineError::NotFound(format!("call {call_id}")))?;
        let mut guard = entry.lock().await;

        if !guard.call.status.is_active() {
            return Err(EngineError::NotFound(format!(
                "call {call_id} is no longer active"
            )));
        }
        if guard.active_index(user_id).is_some() {
            debug!(call = %call_id, user = %user_id, "Rejoin ignored");
            return Ok(());
        }

        let mut next = guard.clone();
        next.participants.push(CallParticipant::new(
            call_id,
            user_id,
            next.call.kind == CallKind::Video,
        ));
        if next.call.status == CallStatus::Ringing {
            next.call.status = CallStatus::InProgress;
        }

        self.persist(&next).await?;
        *guard = next;
        drop(guard);
        self.attach_user(user_id, call_id);

        info!(call = %call_id, user = %user_id, "Participant joined");
        Ok(())
    }

    /// Leave a call, ending it when at most one active participant remains.
    ///
    /// Returns `None` when the user has no active participant record, which
    /// makes a disconnect racing an explicit leave harmless.
    ///
    /// # Errors
    ///
    /// `Transient` on persistence failure.
    pub async fn leave_call(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<LeaveOutcome>, EngineError> {
        let Some(entry) = self.entry(call_id) else {
            return Ok(None);
        };
        let mut guard = entry.lock().await;
        let Some(index) = guard.active_index(user_id) else {
            return Ok(None);
        };

        let now = clock::now_millis();
        // The leaver counts toward the threshold: the call ends when they
        // were the last (or only) active participant.
        let before = guard.active_count();
        let mut next = guard.clone();
        next.participants[index].left_at = Some(now);

        let mut ended = false;
        if next.call.status.is_active() && before <= 1 {
            next.finish(now);
            ended = true;
        }

        self.persist(&next).await?;
        let snapshot = next.snapshot();
        *guard = next;
        drop(guard);

        self.detach_user(user_id, call_id);
        if ended {
            self.by_chat
                .remove_if(&snapshot.call.chat_id, |_, v| v == call_id);
            info!(call = %call_id, user = %user_id, "Participant left; call ended");
        } else {
            info!(call = %call_id, user = %user_id, "Participant left");
        }

        Ok(Some(LeaveOutcome { ended, snapshot }))
    }

    /// Force-end a call, marking every active participant as left.
    ///
    /// Returns `None` if the call already ended.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call id; `Transient` on persistence failure.
    pub async fn end_call(&self, call_id: &str) -> Result<Option<CallSnapshot>, EngineError> {
        let entry = self
            .entry(call_id)
            .ok_or_else(|| EngineError::NotFound(format!("call {call_id}")))?;
        let mut guard = entry.lock().await;

        if !guard.call.status.is_active() {
            return Ok(None);
        }

        let now = clock::now_millis();
        let mut next = guard.clone();
        let mut evicted = Vec::new();
        for participant in next.participants.iter_mut() {
            if participant.is_active() {
                participant.left_at = Some(now);
                evicted.push(participant.user_id.clone());
            }
        }
        next.finish(now);

        self.persist(&next).await?;
        let snapshot = next.snapshot();
        *guard = next;
        drop(guard);

        for user_id in &evicted {
            self.detach_user(user_id, call_id);
        }
        self.by_chat
            .remove_if(&snapshot.call.chat_id, |_, v| v == call_id);

        info!(call = %call_id, participants = evicted.len(), "Call force-ended");
        Ok(Some(snapshot))
    }

    /// Flip the mute flag on the caller's active participant record.
    ///
    /// Returns the new value, or `None` when there is no active record.
    pub async fn toggle_mute(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        self.toggle(call_id, user_id, |p| {
            p.muted = !p.muted;
            p.muted
        })
        .await
    }

    /// Flip the video flag on the caller's active participant record.
    pub async fn toggle_video(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        self.toggle(call_id, user_id, |p| {
            p.video_enabled = !p.video_enabled;
            p.video_enabled
        })
        .await
    }

    /// Flip the screen-share flag on the caller's active participant record.
    /// Independent of the video flag.
    pub async fn toggle_screen_share(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<bool>, EngineError> {
        self.toggle(call_id, user_id, |p| {
            p.screen_sharing = !p.screen_sharing;
            p.screen_sharing
        })
        .await
    }

    /// Current call state and roster.
    pub async fn snapshot(&self, call_id: &str) -> Option<CallSnapshot> {
        let entry = self.entry(call_id)?;
        let guard = entry.lock().await;
        Some(guard.snapshot())
    }

    /// The chat's ringing or in-progress call, if any.
    pub async fn active_call_for_chat(&self, chat_id: &str) -> Option<CallSnapshot> {
        let call_id = self.by_chat.get(chat_id).map(|id| id.clone())?;
        self.snapshot(&call_id).await
    }

    /// Number of ringing or in-progress calls.
    #[must_use]
    pub fn active_call_count(&self) -> usize {
        self.by_chat.len()
    }

    /// Calls the user currently has an active participant record in.
    #[must_use]
    pub fn calls_of(&self, user_id: &str) -> Vec<CallId> {
        self.by_user
            .get(user_id)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    async fn toggle(
        &self,
        call_id: &str,
        user_id: &str,
        flip: impl FnOnce(&mut CallParticipant) -> bool,
    ) -> Result<Option<bool>, EngineError> {
        let Some(entry) = self.entry(call_id) else {
            return Ok(None);
        };
        let mut guard = entry.lock().await;
        let Some(index) = guard.active_index(user_id) else {
            return Ok(None);
        };

        let mut next = guard.clone();
        let value = flip(&mut next.participants[index]);

        self.persist(&next).await?;
        *guard = next;

        debug!(call = %call_id, user = %user_id, value, "Participant flag toggled");
        Ok(Some(value))
    }

    fn entry(&self, call_id: &str) -> Option<Arc<Mutex<CallEntry>>> {
        self.calls.get(call_id).map(|e| Arc::clone(e.value()))
    }

    async fn persist(&self, entry: &CallEntry) -> Result<(), EngineError> {
        self.store
            .save_call(&entry.snapshot())
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))
    }

    fn attach_user(&self, user_id: &str, call_id: &str) {
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(call_id.to_string());
    }

    fn detach_user(&self, user_id: &str, call_id: &str) {
        if let Entry::Occupied(mut entry) = self.by_user.entry(user_id.to_string()) {
            entry.get_mut().remove(call_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCallStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn machine() -> CallStateMachine {
        CallStateMachine::new(Arc::new(MemoryCallStore::new()))
    }

    #[tokio::test]
    async fn start_call_creates_ringing_call_with_initiator() {
        let sm = machine();
        let snapshot = sm.start_call("chat-1", "alice", CallKind::Video).await.unwrap();

        assert_eq!(snapshot.call.status, CallStatus::Ringing);
        assert_eq!(snapshot.participants.len(), 1);
        assert!(snapshot.participants[0].video_enabled);
        assert_eq!(snapshot.participants[0].user_id, "alice");
    }

    #[tokio::test]
    async fn voice_call_initiator_has_video_disabled() {
        let sm = machine();
        let snapshot = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap();
        assert!(!snapshot.participants[0].video_enabled);
    }

    #[tokio::test]
    async fn second_start_in_same_chat_conflicts() {
        let sm = machine();
        sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap();

        let err = sm.start_call("chat-1", "bob", CallKind::Voice).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let sm = Arc::new(machine());

        let mut handles = Vec::new();
        for i in 0..8 {
            let sm = Arc::clone(&sm);
            handles.push(tokio::spawn(async move {
                sm.start_call("chat-1", &format!("user-{i}"), CallKind::Voice)
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert!(sm.active_call_for_chat("chat-1").await.is_some());
    }

    #[tokio::test]
    async fn racing_joins_and_leaves_keep_a_consistent_roster() {
        let sm = Arc::new(machine());
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;

        // Alice stays for the duration, so no racing leave can end the call:
        // every leaver sees at least two active participants.
        let mut handles = Vec::new();
        for i in 0..8 {
            let sm = Arc::clone(&sm);
            let call_id = call.id.clone();
            handles.push(tokio::spawn(async move {
                let user = format!("user-{i}");
                sm.join_call(&call_id, &user).await.unwrap();
                sm.leave_call(&call_id, &user).await.unwrap().unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = sm.snapshot(&call.id).await.unwrap();
        assert_eq!(snapshot.call.status, CallStatus::InProgress);
        // One record per joiner regardless of interleaving; alice remains.
        assert_eq!(snapshot.participants.len(), 9);
        assert_eq!(snapshot.active_participants().len(), 1);
        assert_eq!(snapshot.active_participants()[0].user_id, "alice");
        for i in 0..8 {
            assert!(sm.calls_of(&format!("user-{i}")).is_empty());
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_and_starts_the_call() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;

        sm.join_call(&call.id, "bob").await.unwrap();
        sm.join_call(&call.id, "bob").await.unwrap();

        let snapshot = sm.snapshot(&call.id).await.unwrap();
        assert_eq!(snapshot.call.status, CallStatus::InProgress);
        // One active record per (call, user) even after a rejoin.
        assert_eq!(snapshot.active_participants().len(), 2);
    }

    #[tokio::test]
    async fn join_unknown_call_is_not_found() {
        let sm = machine();
        let err = sm.join_call("missing", "bob").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn leave_ends_call_when_one_remains() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;
        sm.join_call(&call.id, "bob").await.unwrap();

        // First leave keeps the call running with one active participant.
        let outcome = sm.leave_call(&call.id, "alice").await.unwrap().unwrap();
        assert!(!outcome.ended);
        assert_eq!(outcome.snapshot.call.status, CallStatus::InProgress);
        assert_eq!(outcome.snapshot.active_participants().len(), 1);

        // Second leave drops the active count to zero and ends the call.
        let outcome = sm.leave_call(&call.id, "bob").await.unwrap().unwrap();
        assert!(outcome.ended);
        assert_eq!(outcome.snapshot.call.status, CallStatus::Ended);
        assert!(outcome.snapshot.call.duration_secs.is_some());
        assert!(outcome.snapshot.call.ended_at.unwrap() >= outcome.snapshot.call.started_at);

        // The chat slot is free again.
        assert!(sm.start_call("chat-1", "carol", CallKind::Voice).await.is_ok());
    }

    #[tokio::test]
    async fn leave_without_active_record_is_noop() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;

        assert!(sm.leave_call(&call.id, "bob").await.unwrap().is_none());
        assert!(sm.leave_call("missing", "bob").await.unwrap().is_none());

        // A leave racing a disconnect: the second attempt is a no-op.
        assert!(sm.leave_call(&call.id, "alice").await.unwrap().is_some());
        assert!(sm.leave_call(&call.id, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_call_evicts_all_active_participants() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::AudioRoom).await.unwrap().call;
        sm.join_call(&call.id, "bob").await.unwrap();
        sm.join_call(&call.id, "carol").await.unwrap();

        let snapshot = sm.end_call(&call.id).await.unwrap().unwrap();
        assert_eq!(snapshot.call.status, CallStatus::Ended);
        assert!(snapshot.participants.iter().all(|p| !p.is_active()));
        assert_eq!(snapshot.participants.len(), 3);

        // Ending twice reports the boolean failure.
        assert!(sm.end_call(&call.id).await.unwrap().is_none());
        assert!(sm.calls_of("bob").is_empty());
    }

    #[tokio::test]
    async fn toggles_are_independent() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Video).await.unwrap().call;

        assert_eq!(sm.toggle_mute(&call.id, "alice").await.unwrap(), Some(true));
        assert_eq!(
            sm.toggle_screen_share(&call.id, "alice").await.unwrap(),
            Some(true)
        );

        // Screen share did not touch the video flag.
        let snapshot = sm.snapshot(&call.id).await.unwrap();
        assert!(snapshot.participants[0].video_enabled);
        assert!(snapshot.participants[0].muted);

        assert_eq!(sm.toggle_mute(&call.id, "alice").await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn toggle_without_active_record_is_none() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;

        assert_eq!(sm.toggle_mute(&call.id, "bob").await.unwrap(), None);
        assert_eq!(sm.toggle_video("missing", "bob").await.unwrap(), None);
    }

    struct FlakyCallStore {
        fail: AtomicBool,
        inner: MemoryCallStore,
    }

    #[async_trait]
    impl CallStore for FlakyCallStore {
        async fn save_call(&self, snapshot: &CallSnapshot) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError("injected failure".into()));
            }
            self.inner.save_call(snapshot).await
        }

        async fn load_call(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError> {
            self.inner.load_call(call_id).await
        }
    }

    #[tokio::test]
    async fn store_failure_is_transient_and_rolls_back() {
        let store = Arc::new(FlakyCallStore {
            fail: AtomicBool::new(true),
            inner: MemoryCallStore::new(),
        });
        let sm = CallStateMachine::new(Arc::clone(&store) as Arc<dyn CallStore>);

        let err = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));

        // The chat reservation was released; a retry succeeds.
        store.fail.store(false, Ordering::SeqCst);
        assert!(sm.start_call("chat-1", "alice", CallKind::Voice).await.is_ok());
    }

    #[tokio::test]
    async fn calls_of_tracks_active_membership() {
        let sm = machine();
        let call = sm.start_call("chat-1", "alice", CallKind::Voice).await.unwrap().call;
        sm.join_call(&call.id, "bob").await.unwrap();

        assert_eq!(sm.calls_of("bob"), vec![call.id.clone()]);
        sm.leave_call(&call.id, "bob").await.unwrap();
        assert!(sm.calls_of("bob").is_empty());
    }
}
