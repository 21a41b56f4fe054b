//! In-memory fakes for exercising the orchestrator without a network
//!
//! Compiled for unit tests and behind the `testing` feature for integration
//! tests. The fakes model negotiation state faithfully enough that glare,
//! late answers and early candidates behave like they do against a real
//! peer connection.

use crate::config::MediaConstraints;
use crate::ice::{IceCredentialSource, IceServer, IceServerProvider, IceServerSet};
use crate::media::{LocalTracks, MediaDevices, StaticSampleDevices, TrackKind};
use crate::orchestrator::CallServices;
use crate::peer::{
    ConnectionFactory, IceCandidate, LinkEventSink, LinkState, MediaConnection, SdpType,
    SessionDescription, SignalingState,
};
use crate::signaling::{
    protocol::methods, AnswerPayload, CallKind, CandidatePayload, GroupCallAnswered,
    GroupIceCandidate, HubEvent, IncomingGroupCall, MediaToggle, ParticipantGone,
    SignalingClient,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

struct FakeConnectionState {
    signaling: SignalingState,
    local_descriptions: usize,
    remote_descriptions: Vec<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
}

/// Connection that negotiates with opaque SDP strings
///
/// Offers and answers read `offer:{label}:{n}` / `answer:{label}:{n}`. Each
/// local description emits one host candidate through the sink, and the link
/// reports `Connected` once an offer/answer exchange completes.
pub struct FakeConnection {
    label: String,
    sink: LinkEventSink,
    state: Mutex<FakeConnectionState>,
    closed: AtomicBool,
}

impl FakeConnection {
    fn new(label: &str, sink: LinkEventSink) -> Self {
        Self {
            label: label.to_string(),
            sink,
            state: Mutex::new(FakeConnectionState {
                signaling: SignalingState::Stable,
                local_descriptions: 0,
                remote_descriptions: Vec::new(),
                applied_candidates: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Remote descriptions applied so far, in order
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current negotiation state
    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Link id of the sink this connection reports through
    pub fn link_id(&self) -> &str {
        self.sink.link_id()
    }

    /// Emit a transport state change as the real stack would
    pub fn report_state(&self, state: LinkState) {
        self.sink.state_changed(state);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::WebRtcError(format!("connection {} is closed", self.label)));
        }
        Ok(())
    }

    fn local_description(&self, kind: &str) -> String {
        let mut state = self.state.lock();
        state.local_descriptions += 1;
        format!("{}:{}:{}", kind, self.label, state.local_descriptions)
    }

    fn emit_host_candidate(&self, n: &str) {
        self.sink
            .local_candidate(IceCandidate::new(format!("candidate:{} 1 udp host", n)));
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;

        {
            let mut state = self.state.lock();
            match state.signaling {
                SignalingState::Stable | SignalingState::HaveLocalOffer => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                other => {
                    return Err(Error::SdpError(format!("cannot offer in {:?}", other)));
                }
            }
        }

        let sdp = self.local_description("offer");
        self.emit_host_candidate(&sdp);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;

        {
            let mut state = self.state.lock();
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(Error::SdpError(format!(
                    "cannot answer in {:?}",
                    state.signaling
                )));
            }
            state.signaling = SignalingState::Stable;
        }

        let sdp = self.local_description("answer");
        self.emit_host_candidate(&sdp);
        self.sink.state_changed(LinkState::Connected);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;

        let connected = {
            let mut state = self.state.lock();
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(Error::SdpError(format!(
                        "cannot apply remote {:?} in {:?}",
                        sdp_type, current
                    )));
                }
            };
            state.signaling = next;
            state.remote_descriptions.push(description);
            next == SignalingState::Stable
        };

        if connected {
            self.sink.state_changed(LinkState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        if state.remote_descriptions.is_empty() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::IceCandidateError(format!(
                "malformed candidate {:?}",
                candidate.candidate
            )));
        }

        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().signaling = SignalingState::Closed;
        Ok(())
    }
}

struct CreatedConnection {
    name: String,
    connection: Arc<FakeConnection>,
    sink: LinkEventSink,
}

/// Factory recording every connection it creates
#[derive(Default)]
pub struct FakeConnectionFactory {
    created: Mutex<Vec<CreatedConnection>>,
    fail_for: Mutex<HashSet<String>>,
    last_ice_servers: Mutex<Option<IceServerSet>>,
}

impl FakeConnectionFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation fail for links first registered as `username`
    pub fn fail_for(&self, username: &str) {
        self.fail_for.lock().insert(username.to_string());
    }

    /// Connections created so far
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Latest connection created for a link first registered as `name`
    pub fn connection(&self, name: &str) -> Option<Arc<FakeConnection>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|created| created.name == name)
            .map(|created| created.connection.clone())
    }

    /// Every connection created as `name`, oldest first
    pub fn connections_for(&self, name: &str) -> Vec<Arc<FakeConnection>> {
        self.created
            .lock()
            .iter()
            .filter(|created| created.name == name)
            .map(|created| created.connection.clone())
            .collect()
    }

    /// ICE servers handed to the most recent creation
    pub fn last_ice_servers(&self) -> Option<IceServerSet> {
        self.last_ice_servers.lock().clone()
    }

    /// Sink of the latest connection created as `name`
    pub fn sink(&self, name: &str) -> Option<LinkEventSink> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|created| created.name == name)
            .map(|created| created.sink.clone())
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        ice_servers: &IceServerSet,
        tracks: &LocalTracks,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaConnection>> {
        let name = sink.current_identity();
        *self.last_ice_servers.lock() = Some(ice_servers.clone());
        if self.fail_for.lock().contains(&name) {
            return Err(Error::WebRtcError(format!("cannot create link for {}", name)));
        }
        if tracks.is_empty() {
            return Err(Error::InvalidState("no local tracks".to_string()));
        }

        let connection = Arc::new(FakeConnection::new(&name, sink.clone()));
        self.created.lock().push(CreatedConnection {
            name,
            connection: connection.clone(),
            sink,
        });

        Ok(connection)
    }
}

/// Outbound RPC recorded by [`FakeSignaling`]
#[derive(Debug, Clone, PartialEq)]
pub enum HubCall {
    CallGroup {
        group_id: String,
        kind: CallKind,
        offer: SessionDescription,
    },
    AnswerGroupCall {
        call_id: String,
        group_id: String,
        kind: CallKind,
        payload: AnswerPayload,
    },
    SendGroupIceCandidate {
        group_id: String,
        payload: CandidatePayload,
    },
    RejectGroupCall {
        call_id: String,
        group_id: String,
    },
    EndGroupCall {
        call_id: String,
        group_id: String,
    },
    ToggleGroupCamera {
        group_id: String,
        enabled: bool,
    },
    ToggleGroupMicrophone {
        group_id: String,
        enabled: bool,
    },
}

impl HubCall {
    /// Group the RPC was addressed to
    pub fn group_id(&self) -> &str {
        match self {
            HubCall::CallGroup { group_id, .. }
            | HubCall::AnswerGroupCall { group_id, .. }
            | HubCall::SendGroupIceCandidate { group_id, .. }
            | HubCall::RejectGroupCall { group_id, .. }
            | HubCall::EndGroupCall { group_id, .. }
            | HubCall::ToggleGroupCamera { group_id, .. }
            | HubCall::ToggleGroupMicrophone { group_id, .. } => group_id,
        }
    }

    /// Event the hub broadcasts to the other group members for this RPC
    ///
    /// `call_id` is the id the hub assigned to the call; it is only used for
    /// `callGroup`, whose request does not carry one.
    pub fn into_event(self, sender: &str, call_id: &str) -> HubEvent {
        match self {
            HubCall::CallGroup {
                group_id,
                kind,
                offer,
            } => HubEvent::IncomingGroupCall(IncomingGroupCall {
                call_id: call_id.to_string(),
                group_id,
                caller_identity: sender.to_string(),
                kind,
                offer,
            }),
            HubCall::AnswerGroupCall {
                group_id, payload, ..
            } => HubEvent::GroupCallAnswered(GroupCallAnswered {
                answerer_identity: sender.to_string(),
                group_id,
                answer_payload: payload,
            }),
            HubCall::SendGroupIceCandidate { payload, .. } => {
                HubEvent::GroupIceCandidate(GroupIceCandidate {
                    sender_identity: sender.to_string(),
                    candidate_payload: payload,
                })
            }
            HubCall::RejectGroupCall { .. } => HubEvent::GroupCallRejected(ParticipantGone {
                identity: sender.to_string(),
            }),
            HubCall::EndGroupCall { .. } => HubEvent::GroupCallEnded(ParticipantGone {
                identity: sender.to_string(),
            }),
            HubCall::ToggleGroupCamera { enabled, .. } => {
                HubEvent::GroupCameraToggle(MediaToggle {
                    identity: sender.to_string(),
                    enabled,
                })
            }
            HubCall::ToggleGroupMicrophone { enabled, .. } => {
                HubEvent::GroupMicrophoneToggle(MediaToggle {
                    identity: sender.to_string(),
                    enabled,
                })
            }
        }
    }
}

type CallGroupHook = Box<dyn Fn() + Send + Sync>;

/// Hub client recording every RPC instead of sending it
pub struct FakeSignaling {
    call_id: String,
    calls: Mutex<Vec<HubCall>>,
    failing: Mutex<HashSet<String>>,
    call_group_gate: Mutex<Option<Arc<Notify>>>,
    call_group_hook: Mutex<Option<CallGroupHook>>,
}

impl Default for FakeSignaling {
    fn default() -> Self {
        Self::with_call_id("call-1")
    }
}

impl FakeSignaling {
    /// Create a client whose `callGroup` returns `call-1`
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client whose `callGroup` returns `call_id`
    pub fn with_call_id(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            call_group_gate: Mutex::new(None),
            call_group_hook: Mutex::new(None),
        }
    }

    /// Id returned by `callGroup`
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Make every future call of hub method `method` fail
    pub fn fail_method(&self, method: &str) {
        self.failing.lock().insert(method.to_string());
    }

    /// Make `callGroup` wait until the returned notify fires
    pub fn hold_call_group(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.call_group_gate.lock() = Some(gate.clone());
        gate
    }

    /// Run `hook` inside `callGroup`, before it returns
    pub fn on_call_group(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.call_group_hook.lock() = Some(Box::new(hook));
    }

    /// RPCs recorded so far
    pub fn calls(&self) -> Vec<HubCall> {
        self.calls.lock().clone()
    }

    /// Drain the recorded RPCs
    pub fn take_calls(&self) -> Vec<HubCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, method: &str, call: HubCall) -> Result<()> {
        self.calls.lock().push(call);

        if self.failing.lock().contains(method) {
            return Err(Error::SignalingRpcFailed(format!("{} rejected", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    async fn call_group(
        &self,
        group_id: &str,
        kind: CallKind,
        offer: SessionDescription,
    ) -> Result<String> {
        let gate = self.call_group_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.record(
            methods::CALL_GROUP,
            HubCall::CallGroup {
                group_id: group_id.to_string(),
                kind,
                offer,
            },
        )?;

        if let Some(hook) = self.call_group_hook.lock().as_ref() {
            hook();
        }
        Ok(self.call_id.clone())
    }

    async fn answer_group_call(
        &self,
        call_id: &str,
        group_id: &str,
        kind: CallKind,
        payload: AnswerPayload,
    ) -> Result<()> {
        self.record(
            methods::ANSWER_GROUP_CALL,
            HubCall::AnswerGroupCall {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
                kind,
                payload,
            },
        )
    }

    async fn send_group_ice_candidate(
        &self,
        group_id: &str,
        payload: CandidatePayload,
    ) -> Result<()> {
        self.record(
            methods::SEND_GROUP_ICE_CANDIDATE,
            HubCall::SendGroupIceCandidate {
                group_id: group_id.to_string(),
                payload,
            },
        )
    }

    async fn reject_group_call(&self, call_id: &str, group_id: &str) -> Result<()> {
        self.record(
            methods::REJECT_GROUP_CALL,
            HubCall::RejectGroupCall {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
            },
        )
    }

    async fn end_group_call(&self, call_id: &str, group_id: &str) -> Result<()> {
        self.record(
            methods::END_GROUP_CALL,
            HubCall::EndGroupCall {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
            },
        )
    }

    async fn toggle_group_camera(&self, group_id: &str, enabled: bool) -> Result<()> {
        self.record(
            methods::TOGGLE_GROUP_CAMERA,
            HubCall::ToggleGroupCamera {
                group_id: group_id.to_string(),
                enabled,
            },
        )
    }

    async fn toggle_group_microphone(&self, group_id: &str, enabled: bool) -> Result<()> {
        self.record(
            methods::TOGGLE_GROUP_MICROPHONE,
            HubCall::ToggleGroupMicrophone {
                group_id: group_id.to_string(),
                enabled,
            },
        )
    }
}

/// Credential source serving one STUN entry, or failing on demand
#[derive(Default)]
pub struct FakeIceSource {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeIceSource {
    /// STUN entry served on success
    pub const STUN_URL: &'static str = "stun:stun.test:3478";

    /// Make every future fetch fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of fetches that reached the source
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IceCredentialSource for FakeIceSource {
    async fn fetch_servers(&self) -> Result<Vec<IceServer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::IceServerFetchFailed("endpoint down".to_string()));
        }
        Ok(vec![IceServer::stun(Self::STUN_URL)])
    }
}

/// Static sample devices that can be told to refuse a kind
#[derive(Default)]
pub struct FakeDevices {
    refuse: Mutex<Option<TrackKind>>,
    opened: AtomicUsize,
}

impl FakeDevices {
    /// Make opening `kind` fail, as if permission was denied
    pub fn refuse(&self, kind: TrackKind) {
        *self.refuse.lock() = Some(kind);
    }

    /// Tracks opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
        stream_id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        if *self.refuse.lock() == Some(kind) {
            return Err(Error::MediaAcquisitionFailed(format!(
                "{} permission denied",
                kind
            )));
        }

        let track = StaticSampleDevices.open(kind, constraints, stream_id).await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(track)
    }
}

/// One client's worth of fakes
#[derive(Clone)]
pub struct FakeServices {
    pub signaling: Arc<FakeSignaling>,
    pub ice_source: Arc<FakeIceSource>,
    pub ice: Arc<IceServerProvider>,
    pub devices: Arc<FakeDevices>,
    pub connections: Arc<FakeConnectionFactory>,
}

impl Default for FakeServices {
    fn default() -> Self {
        Self::with_signaling(FakeSignaling::new())
    }
}

impl FakeServices {
    /// Fallback STUN entry of the fake ICE provider
    pub const FALLBACK_STUN_URL: &'static str = "stun:fallback.test:3478";

    /// Fresh fakes with a `callGroup` returning `call-1`
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh fakes around the given signaling client
    pub fn with_signaling(signaling: FakeSignaling) -> Self {
        let ice_source = Arc::new(FakeIceSource::default());
        let ice = Arc::new(IceServerProvider::new(
            ice_source.clone(),
            Self::FALLBACK_STUN_URL,
        ));

        Self {
            signaling: Arc::new(signaling),
            ice_source,
            ice,
            devices: Arc::new(FakeDevices::default()),
            connections: Arc::new(FakeConnectionFactory::new()),
        }
    }

    /// Services bundle for [`GroupCallOrchestrator::new`](crate::GroupCallOrchestrator::new)
    pub fn services(&self) -> CallServices {
        CallServices {
            signaling: self.signaling.clone(),
            ice: self.ice.clone(),
            devices: self.devices.clone(),
            connections: self.connections.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_call_fan_out_shapes() {
        let offer = HubCall::CallGroup {
            group_id: "g1".to_string(),
            kind: CallKind::Audio,
            offer: SessionDescription::offer("offer:x:1"),
        };
        assert_eq!(offer.group_id(), "g1");

        match offer.into_event("carol", "call-7") {
            HubEvent::IncomingGroupCall(call) => {
                assert_eq!(call.call_id, "call-7");
                assert_eq!(call.caller_identity, "carol");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let end = HubCall::EndGroupCall {
            call_id: "call-7".to_string(),
            group_id: "g1".to_string(),
        };
        assert_eq!(
            end.into_event("xavier", "ignored"),
            HubEvent::GroupCallEnded(ParticipantGone {
                identity: "xavier".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_fake_connection_rejects_glare() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = LinkEventSink::new(
            "link-1".to_string(),
            crate::peer::LinkIdentity::new("bob"),
            tx,
        );
        let connection = FakeConnection::new("bob", sink);

        connection.create_offer().await.unwrap();
        let err = connection
            .set_remote_description(SessionDescription::offer("offer:alice:1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SdpError(_)));
        assert_eq!(
            MediaConnection::signaling_state(&connection),
            SignalingState::HaveLocalOffer
        );
    }
}
