//! Call state published to the UI

use crate::media::TrackKind;
use crate::peer::LinkState;
use crate::signaling::{CallKind, IncomingGroupCall};
use serde::Serialize;

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Sent the broadcast offer
    Caller,
    /// Accepted an incoming call
    Callee,
}

/// Lifecycle of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Idle,
    Starting,
    Active,
    Leaving,
    Ended,
}

/// The call this client is part of
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Hub-assigned id; unknown while a caller is still starting
    pub call_id: Option<String>,

    /// Group the call belongs to
    pub group_id: String,

    /// Audio or video
    pub kind: CallKind,

    /// Caller or callee
    pub role: CallRole,

    /// Current lifecycle step
    pub lifecycle: Lifecycle,

    /// Identity of the caller (ourselves when [`CallRole::Caller`])
    pub caller_identity: String,
}

/// Remote media received from one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    /// Remote stream id
    pub stream_id: String,

    /// Kinds of tracks received so far
    pub kinds: Vec<TrackKind>,
}

/// Remote member of the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub username: String,
    pub media_stream: Option<RemoteStream>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub link_state: LinkState,
}

impl Participant {
    pub(crate) fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            media_stream: None,
            video_enabled: true,
            audio_enabled: true,
            link_state: LinkState::New,
        }
    }
}

/// Immutable view of the call state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    /// Current session, if any
    pub session: Option<CallSession>,

    /// Call ringing on this client
    pub incoming: Option<IncomingGroupCall>,

    /// Remote participants sorted by username
    pub participants: Vec<Participant>,

    pub local_audio_enabled: bool,
    pub local_video_enabled: bool,

    /// Last session-level failure
    pub last_error: Option<String>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            session: None,
            incoming: None,
            participants: Vec::new(),
            local_audio_enabled: true,
            local_video_enabled: true,
            last_error: None,
        }
    }
}

impl CallSnapshot {
    /// Lifecycle of the current session, `Idle` without one
    pub fn lifecycle(&self) -> Lifecycle {
        self.session
            .as_ref()
            .map(|session| session.lifecycle)
            .unwrap_or(Lifecycle::Idle)
    }

    /// Participant by username
    pub fn participant(&self, username: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.username == username)
    }

    /// Usernames of every participant, sorted
    pub fn usernames(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.username.clone()).collect()
    }
}

/// One-shot notice for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    /// A call started ringing
    IncomingCall(IncomingGroupCall),
    /// The ringing call ended before it was answered or rejected
    IncomingCallCancelled { call_id: String },
    /// The last remote participant left; the UI decides whether to hang up
    RosterEmptied,
    /// Starting or accepting a call failed and was rolled back
    StartFailed(String),
    /// The session ended
    CallEnded,
}
