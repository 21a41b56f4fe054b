//! Call session store
//!
//! Owned and mutated by the call task only. Every mutation republishes an
//! immutable [`CallSnapshot`] on a watch channel; notices go out on a
//! broadcast channel.

use super::state::{
    CallNotice, CallSession, CallSnapshot, Lifecycle, Participant, RemoteStream,
};
use crate::peer::{LinkState, RemoteTrackInfo};
use crate::signaling::IncomingGroupCall;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const NOTICE_CAPACITY: usize = 64;

/// Read side of the store, cheap to clone
#[derive(Clone)]
pub struct CallStoreHandle {
    snapshots: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallStoreHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Receiver for notices raised after this call
    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }
}

/// Authoritative call state
pub struct CallSessionStore {
    session: Option<CallSession>,
    incoming: Option<IncomingGroupCall>,
    participants: BTreeMap<String, Participant>,
    local_audio_enabled: bool,
    local_video_enabled: bool,
    last_error: Option<String>,
    snapshots: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl Default for CallSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSessionStore {
    /// Create an idle store
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(CallSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            session: None,
            incoming: None,
            participants: BTreeMap::new(),
            local_audio_enabled: true,
            local_video_enabled: true,
            last_error: None,
            snapshots,
            notices,
        }
    }

    /// Read handle for the UI
    pub fn handle(&self) -> CallStoreHandle {
        CallStoreHandle {
            snapshots: self.snapshots.subscribe(),
            notices: self.notices.clone(),
        }
    }

    /// Current session
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Current lifecycle, `Idle` without a session
    pub fn lifecycle(&self) -> Lifecycle {
        self.session
            .as_ref()
            .map(|session| session.lifecycle)
            .unwrap_or(Lifecycle::Idle)
    }

    /// Ringing call
    pub fn incoming(&self) -> Option<&IncomingGroupCall> {
        self.incoming.as_ref()
    }

    /// Rostered usernames, sorted
    pub fn usernames(&self) -> Vec<String> {
        self.participants.keys().cloned().collect()
    }

    /// Start a session; the roster starts empty
    pub(crate) fn begin(&mut self, session: CallSession) {
        debug!(
            "Session {:?} for group {} ({:?})",
            session.lifecycle, session.group_id, session.role
        );
        self.session = Some(session);
        self.incoming = None;
        self.participants.clear();
        self.last_error = None;
        self.publish();
    }

    pub(crate) fn set_call_id(&mut self, call_id: &str) {
        if let Some(session) = self.session.as_mut() {
            session.call_id = Some(call_id.to_string());
            self.publish();
        }
    }

    pub(crate) fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if let Some(session) = self.session.as_mut() {
            debug!("Lifecycle {:?} -> {:?}", session.lifecycle, lifecycle);
            session.lifecycle = lifecycle;
            self.publish();
        }
    }

    /// Drop the session after a normal leave
    pub(crate) fn end(&mut self) {
        if self.session.take().is_none() {
            return;
        }
        self.participants.clear();
        self.local_audio_enabled = true;
        self.local_video_enabled = true;
        self.publish();
        self.notify(CallNotice::CallEnded);
    }

    /// Drop the session after a failed start and record the error
    pub(crate) fn fail_start(&mut self, message: String) {
        self.session = None;
        self.participants.clear();
        self.local_audio_enabled = true;
        self.local_video_enabled = true;
        self.last_error = Some(message.clone());
        self.publish();
        self.notify(CallNotice::StartFailed(message));
    }

    pub(crate) fn set_incoming(&mut self, call: IncomingGroupCall) {
        self.incoming = Some(call.clone());
        self.publish();
        self.notify(CallNotice::IncomingCall(call));
    }

    /// Clear the ringing call after accept or reject
    pub(crate) fn take_incoming(&mut self) -> Option<IncomingGroupCall> {
        let call = self.incoming.take();
        if call.is_some() {
            self.publish();
        }
        call
    }

    /// Clear the ringing call because the caller went away
    pub(crate) fn cancel_incoming(&mut self) -> Option<IncomingGroupCall> {
        let call = self.incoming.take()?;
        self.publish();
        self.notify(CallNotice::IncomingCallCancelled {
            call_id: call.call_id.clone(),
        });
        Some(call)
    }

    /// Roster `username` if not already present
    pub(crate) fn add_participant(&mut self, username: &str) {
        if self.participants.contains_key(username) {
            return;
        }
        self.participants
            .insert(username.to_string(), Participant::new(username));
        self.publish();
    }

    /// Remove `username`; raises `RosterEmptied` when it was the last one
    pub(crate) fn remove_participant(&mut self, username: &str) -> bool {
        if self.participants.remove(username).is_none() {
            return false;
        }

        self.publish();
        if self.participants.is_empty() {
            debug!("Roster emptied after {} left", username);
            self.notify(CallNotice::RosterEmptied);
        }
        true
    }

    pub(crate) fn add_remote_track(&mut self, username: &str, track: &RemoteTrackInfo) {
        let Some(participant) = self.participants.get_mut(username) else {
            return;
        };

        let stream = participant.media_stream.get_or_insert_with(|| RemoteStream {
            stream_id: track.stream_id.clone(),
            kinds: Vec::new(),
        });
        stream.stream_id = track.stream_id.clone();
        if !stream.kinds.contains(&track.kind) {
            stream.kinds.push(track.kind);
        }
        self.publish();
    }

    pub(crate) fn set_participant_video(&mut self, username: &str, enabled: bool) {
        if let Some(participant) = self.participants.get_mut(username) {
            participant.video_enabled = enabled;
            self.publish();
        }
    }

    pub(crate) fn set_participant_audio(&mut self, username: &str, enabled: bool) {
        if let Some(participant) = self.participants.get_mut(username) {
            participant.audio_enabled = enabled;
            self.publish();
        }
    }

    pub(crate) fn set_participant_link_state(&mut self, username: &str, state: LinkState) {
        if let Some(participant) = self.participants.get_mut(username) {
            participant.link_state = state;
            self.publish();
        }
    }

    pub(crate) fn set_local_audio(&mut self, enabled: bool) {
        self.local_audio_enabled = enabled;
        self.publish();
    }

    pub(crate) fn set_local_video(&mut self, enabled: bool) {
        self.local_video_enabled = enabled;
        self.publish();
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session: self.session.clone(),
            incoming: self.incoming.clone(),
            participants: self.participants.values().cloned().collect(),
            local_audio_enabled: self.local_audio_enabled,
            local_video_enabled: self.local_video_enabled,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn notify(&self, notice: CallNotice) {
        // No subscriber is fine
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::session::state::CallRole;
    use crate::signaling::CallKind;

    fn session() -> CallSession {
        CallSession {
            call_id: None,
            group_id: "g1".to_string(),
            kind: CallKind::Video,
            role: CallRole::Caller,
            lifecycle: Lifecycle::Starting,
            caller_identity: "carol".to_string(),
        }
    }

    #[test]
    fn test_snapshot_published_on_change() {
        let mut store = CallSessionStore::new();
        let handle = store.handle();
        assert_eq!(handle.snapshot().lifecycle(), Lifecycle::Idle);

        store.begin(session());
        store.set_call_id("call-1");
        store.set_lifecycle(Lifecycle::Active);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.lifecycle(), Lifecycle::Active);
        assert_eq!(
            snapshot.session.unwrap().call_id.as_deref(),
            Some("call-1")
        );
    }

    #[test]
    fn test_participants_sorted() {
        let mut store = CallSessionStore::new();
        let handle = store.handle();
        store.begin(session());

        store.add_participant("zed");
        store.add_participant("amy");
        store.add_participant("amy");

        assert_eq!(handle.snapshot().usernames(), vec!["amy", "zed"]);
    }

    #[test]
    fn test_roster_emptied_once() {
        let mut store = CallSessionStore::new();
        let handle = store.handle();
        let mut notices = handle.notices();
        store.begin(session());

        store.add_participant("xavier");
        assert!(store.remove_participant("xavier"));
        assert!(!store.remove_participant("xavier"));

        assert_eq!(notices.try_recv().unwrap(), CallNotice::RosterEmptied);
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn test_remote_tracks_merge_into_stream() {
        let mut store = CallSessionStore::new();
        let handle = store.handle();
        store.begin(session());
        store.add_participant("bob");

        for kind in [TrackKind::Audio, TrackKind::Video, TrackKind::Audio] {
            store.add_remote_track(
                "bob",
                &RemoteTrackInfo {
                    track_id: format!("{}-1", kind),
                    stream_id: "s-bob".to_string(),
                    kind,
                },
            );
        }

        let snapshot = handle.snapshot();
        let stream = snapshot.participant("bob").unwrap().media_stream.clone().unwrap();
        assert_eq!(stream.stream_id, "s-bob");
        assert_eq!(stream.kinds, vec![TrackKind::Audio, TrackKind::Video]);
    }

    #[test]
    fn test_fail_start_records_error() {
        let mut store = CallSessionStore::new();
        let handle = store.handle();
        let mut notices = handle.notices();

        store.begin(session());
        store.fail_start("no camera".to_string());

        let snapshot = handle.snapshot();
        assert!(snapshot.session.is_none());
        assert_eq!(snapshot.last_error.as_deref(), Some("no camera"));
        assert_eq!(
            notices.try_recv().unwrap(),
            CallNotice::StartFailed("no camera".to_string())
        );

        store.begin(session());
        assert!(handle.snapshot().last_error.is_none());
    }

    #[test]
    fn test_end_without_session_is_silent() {
        let mut store = CallSessionStore::new();
        let mut notices = store.handle().notices();

        store.end();
        assert!(notices.try_recv().is_err());

        store.begin(session());
        store.end();
        assert_eq!(notices.try_recv().unwrap(), CallNotice::CallEnded);
    }
}
