//! Peer link: one pairwise connection plus its negotiation sub-state

use super::connection::{
    IceCandidate, LinkState, MediaConnection, RemoteTrackInfo, SignalingState,
};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Mutable identity cell shared between a link and its callbacks
///
/// Callbacks read the identity at emit time, so a rename after registration is
/// reflected in every event the link reports afterwards.
#[derive(Debug, Clone)]
pub struct LinkIdentity(Arc<RwLock<String>>);

impl LinkIdentity {
    /// Create a cell holding `username`
    pub fn new(username: &str) -> Self {
        Self(Arc::new(RwLock::new(username.to_string())))
    }

    /// Identity at this moment
    pub fn current(&self) -> String {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, username: &str) {
        *self.0.write() = username.to_string();
    }
}

/// Event reported by a link's connection callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// Local ICE candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    /// Remote media track arrived
    RemoteTrack(RemoteTrackInfo),
    /// Transport state changed
    StateChanged(LinkState),
}

/// Link event tagged with the emitting connection instance
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    /// Connection instance that emitted the event
    pub link_id: String,

    /// Link identity when the event was emitted
    pub identity: String,

    /// Event payload
    pub kind: LinkEventKind,
}

/// Narrow callback target handed to a connection
///
/// Events go to the call task's channel instead of back into the registry.
#[derive(Clone)]
pub struct LinkEventSink {
    link_id: String,
    identity: LinkIdentity,
    detached: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub(crate) fn new(
        link_id: String,
        identity: LinkIdentity,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            link_id,
            identity,
            detached: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Connection instance id
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// Link identity at this moment
    pub fn current_identity(&self) -> String {
        self.identity.current()
    }

    /// Report a gathered local candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEventKind::LocalCandidate(candidate));
    }

    /// Report an arrived remote track
    pub fn remote_track(&self, track: RemoteTrackInfo) {
        self.emit(LinkEventKind::RemoteTrack(track));
    }

    /// Report a transport state change
    pub fn state_changed(&self, state: LinkState) {
        self.emit(LinkEventKind::StateChanged(state));
    }

    /// Whether the link was removed from the registry
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn emit(&self, kind: LinkEventKind) {
        if self.is_detached() {
            trace!("Dropping event from detached link {}", self.link_id);
            return;
        }

        // Receiver is gone once the call task exits
        let _ = self.tx.send(LinkEvent {
            link_id: self.link_id.clone(),
            identity: self.identity.current(),
            kind,
        });
    }
}

/// One pairwise link owned by the registry
pub struct PeerLink {
    pub(crate) identity: LinkIdentity,
    pub(crate) sink: LinkEventSink,
    pub(crate) connection: Arc<dyn MediaConnection>,
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    pub(crate) has_remote_description: bool,
    pub(crate) state: LinkState,
}

impl PeerLink {
    pub(crate) fn new(
        identity: LinkIdentity,
        sink: LinkEventSink,
        connection: Arc<dyn MediaConnection>,
    ) -> Self {
        Self {
            identity,
            sink,
            connection,
            pending_candidates: VecDeque::new(),
            has_remote_description: false,
            state: LinkState::New,
        }
    }

    /// Current identity of the remote participant
    pub fn username(&self) -> String {
        self.identity.current()
    }

    /// Connection instance id
    pub fn link_id(&self) -> &str {
        self.sink.link_id()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    /// Negotiation state of the connection
    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Last reported transport state
    pub fn state(&self) -> LinkState {
        self.state
    }
}
