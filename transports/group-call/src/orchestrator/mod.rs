//! Group call orchestration
//!
//! [`GroupCallOrchestrator`] is the state machine behind one client's view of
//! a mesh group call. It is driven by a single task (see
//! [`runtime`](crate::runtime)), so every method takes `&mut self` and no
//! locking is needed around the registry or the session store.
//!
//! # Session lifecycle
//!
//! ```text
//! Idle ──start/accept──▶ Starting ──▶ Active ──leave──▶ Leaving ──▶ Ended
//!                           │
//!                           └──failure / hang-up──▶ Idle (rolled back)
//! ```
//!
//! A caller does not know who will answer its broadcast offer, so the offer is
//! made on a link registered under a placeholder identity. The first answer
//! renames that link to the answerer; later answerers get their own targeted
//! offers. Non-callers pair up among themselves through [`tie_break`].
//!
//! A client that is still ringing cannot act on other members' answers, so it
//! remembers who joined and pairs with them once it accepts.

pub mod tie_break;

use crate::config::GroupCallConfig;
use crate::ice::IceServerProvider;
use crate::media::{LocalMediaSource, MediaDevices};
use crate::peer::{
    ConnectionFactory, ConnectionRegistry, LinkEvent, LinkEventKind, LinkState,
};
use crate::session::{
    CallRole, CallSession, CallSessionStore, CallStoreHandle, Lifecycle,
};
use crate::signaling::{
    AnswerPayload, CallKind, CandidatePayload, GroupCallAnswered, GroupIceCandidate, HubEvent,
    IncomingGroupCall, SignalingClient,
};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tie_break::{AnswerAction, AnswerContext};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Hang-up request observed by a suspended start/accept step
///
/// Set from outside the call task, which may be parked inside a step; the step
/// checks it after every suspension point.
#[derive(Debug, Clone, Default)]
pub struct HangupFlag(Arc<AtomicBool>);

impl HangupFlag {
    /// Request a hang-up
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a hang-up is pending
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn check(&self, after: &str) -> Result<()> {
        if self.is_raised() {
            return Err(Error::Cancelled(format!("hung up during {}", after)));
        }
        Ok(())
    }
}

/// External collaborators of the orchestrator
#[derive(Clone)]
pub struct CallServices {
    /// Hub RPC surface
    pub signaling: Arc<dyn SignalingClient>,

    /// ICE credential provider, shared process-wide
    pub ice: Arc<IceServerProvider>,

    /// Local capture devices
    pub devices: Arc<dyn MediaDevices>,

    /// Creates the connection behind each peer link
    pub connections: Arc<dyn ConnectionFactory>,
}

/// Mesh group call state machine
pub struct GroupCallOrchestrator {
    local_identity: String,
    placeholder_identity: String,
    signaling: Arc<dyn SignalingClient>,
    ice: Arc<IceServerProvider>,
    media: LocalMediaSource,
    registry: ConnectionRegistry,
    store: CallSessionStore,
    hangup: HangupFlag,
    placeholder_claimed: bool,
    joined_while_ringing: BTreeSet<String>,
}

impl GroupCallOrchestrator {
    /// Create an idle orchestrator
    ///
    /// Returns the receiver for link callback events, which the call task
    /// must feed back through [`handle_link_event`](Self::handle_link_event).
    pub fn new(
        config: &GroupCallConfig,
        services: CallServices,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        config.validate()?;

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(services.connections, link_tx, config.max_peers);
        let media = LocalMediaSource::new(services.devices, config.media.clone());

        let orchestrator = Self {
            local_identity: config.local_identity.clone(),
            placeholder_identity: config.placeholder_identity.clone(),
            signaling: services.signaling,
            ice: services.ice,
            media,
            registry,
            store: CallSessionStore::new(),
            hangup: HangupFlag::default(),
            placeholder_claimed: false,
            joined_while_ringing: BTreeSet::new(),
        };

        Ok((orchestrator, link_rx))
    }

    /// Our identity on the hub
    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Read handle for the UI
    pub fn store_handle(&self) -> CallStoreHandle {
        self.store.handle()
    }

    /// Flag that cancels an in-flight start/accept
    pub fn hangup_flag(&self) -> HangupFlag {
        self.hangup.clone()
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> Lifecycle {
        self.store.lifecycle()
    }

    /// Peer links of the current call
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Local tracks
    pub fn media(&self) -> &LocalMediaSource {
        &self.media
    }

    /// Whether the placeholder link has been renamed to a first answerer
    pub fn placeholder_claimed(&self) -> bool {
        self.placeholder_claimed
    }

    /// Start a call in `group_id`
    ///
    /// Offers on a placeholder link and broadcasts the offer. Any failure,
    /// including a hang-up while suspended, rolls back to `Idle`.
    #[instrument(skip(self), fields(local = %self.local_identity))]
    pub async fn start_call(&mut self, group_id: &str, kind: CallKind) -> Result<()> {
        self.ensure_idle()?;
        if self.store.incoming().is_some() {
            return Err(Error::InvalidState(
                "cannot start a call while one is ringing".to_string(),
            ));
        }

        self.hangup.reset();
        self.placeholder_claimed = false;
        self.store.begin(CallSession {
            call_id: None,
            group_id: group_id.to_string(),
            kind,
            role: CallRole::Caller,
            lifecycle: Lifecycle::Starting,
            caller_identity: self.local_identity.clone(),
        });

        match self.run_start(group_id, kind).await {
            Ok(()) => {
                self.store.set_lifecycle(Lifecycle::Active);
                info!("Call started in group {}", group_id);
                Ok(())
            }
            Err(e) => {
                self.roll_back(group_id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_start(&mut self, group_id: &str, kind: CallKind) -> Result<()> {
        let ice_servers = self.ice.fetch().await;
        self.hangup.check("ICE server fetch")?;

        let tracks = self.media.acquire(kind.wants_video(), true).await?;
        self.hangup.check("media acquisition")?;

        self.registry.prepare(ice_servers, tracks);
        let placeholder = self.placeholder_identity.clone();
        self.registry.ensure(&placeholder).await?;
        self.hangup.check("link creation")?;

        let offer = self.registry.create_offer(&placeholder).await?;
        self.hangup.check("offer creation")?;

        let call_id = self.signaling.call_group(group_id, kind, offer).await?;
        self.store.set_call_id(&call_id);
        self.hangup.check("callGroup")?;

        Ok(())
    }

    /// Accept `incoming`
    #[instrument(skip(self, incoming), fields(local = %self.local_identity, call_id = %incoming.call_id))]
    pub async fn accept_call(&mut self, incoming: IncomingGroupCall) -> Result<()> {
        self.ensure_idle()?;

        self.hangup.reset();
        self.placeholder_claimed = false;
        self.store.take_incoming();
        self.store.begin(CallSession {
            call_id: Some(incoming.call_id.clone()),
            group_id: incoming.group_id.clone(),
            kind: incoming.kind,
            role: CallRole::Callee,
            lifecycle: Lifecycle::Starting,
            caller_identity: incoming.caller_identity.clone(),
        });

        match self.run_accept(&incoming).await {
            Ok(()) => {
                self.store.set_lifecycle(Lifecycle::Active);
                info!(
                    "Joined call {} from {}",
                    incoming.call_id, incoming.caller_identity
                );
                self.pair_with_earlier_joiners().await;
                Ok(())
            }
            Err(e) => {
                self.roll_back(&incoming.group_id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_accept(&mut self, incoming: &IncomingGroupCall) -> Result<()> {
        let caller = incoming.caller_identity.as_str();

        let ice_servers = self.ice.fetch().await;
        self.hangup.check("ICE server fetch")?;

        let tracks = self.media.acquire(incoming.kind.wants_video(), true).await?;
        self.hangup.check("media acquisition")?;

        self.registry.prepare(ice_servers, tracks);
        self.registry.ensure(caller).await?;
        self.hangup.check("link creation")?;

        self.registry
            .set_remote_description(caller, incoming.offer.clone())
            .await?;
        self.hangup.check("applying the offer")?;

        let answer = self.registry.create_answer(caller).await?;
        self.hangup.check("answer creation")?;

        // The answer goes to every member: it is how other callees learn we joined
        self.signaling
            .answer_group_call(
                &incoming.call_id,
                &incoming.group_id,
                incoming.kind,
                AnswerPayload::broadcast(answer),
            )
            .await?;
        self.hangup.check("answerGroupCall")?;

        self.store.add_participant(caller);
        Ok(())
    }

    /// Accept the call currently ringing
    pub async fn accept_ringing(&mut self) -> Result<()> {
        let incoming = self
            .store
            .incoming()
            .cloned()
            .ok_or_else(|| Error::InvalidState("no incoming call".to_string()))?;

        self.accept_call(incoming).await
    }

    /// Decline the call currently ringing
    pub async fn reject_call(&mut self) -> Result<()> {
        let call = self
            .store
            .take_incoming()
            .ok_or_else(|| Error::InvalidState("no incoming call".to_string()))?;

        self.joined_while_ringing.clear();
        let dropped = self.registry.discard_pending(&call.caller_identity);
        debug!("Rejecting call {} ({} queued candidates dropped)", call.call_id, dropped);

        self.signaling
            .reject_group_call(&call.call_id, &call.group_id)
            .await
    }

    /// Leave the current call
    ///
    /// No-op while idle; rejects a ringing call.
    pub async fn leave_call(&mut self) -> Result<()> {
        let result = match self.store.lifecycle() {
            Lifecycle::Idle if self.store.incoming().is_some() => self.reject_call().await,
            Lifecycle::Idle | Lifecycle::Leaving | Lifecycle::Ended => Ok(()),
            Lifecycle::Starting | Lifecycle::Active => {
                self.teardown().await;
                Ok(())
            }
        };

        self.hangup.reset();
        result
    }

    async fn teardown(&mut self) {
        self.store.set_lifecycle(Lifecycle::Leaving);

        if let Some(session) = self.store.session().cloned() {
            if let Some(call_id) = session.call_id.as_deref() {
                if let Err(e) = self.signaling.end_group_call(call_id, &session.group_id).await {
                    warn!("Failed to notify hub of leave: {}", e);
                }
            }
        }

        self.registry.close_all().await;
        self.media.release();
        self.placeholder_claimed = false;

        self.store.set_lifecycle(Lifecycle::Ended);
        self.store.end();
        info!("Left call");
    }

    async fn roll_back(&mut self, group_id: &str, cause: &Error) {
        warn!("Call setup rolled back: {}", cause);

        self.registry.close_all().await;
        self.media.release();
        self.placeholder_claimed = false;

        let call_id = self.store.session().and_then(|s| s.call_id.clone());
        if let Some(call_id) = call_id {
            if let Err(e) = self.signaling.end_group_call(&call_id, group_id).await {
                warn!("Failed to end call {} on the hub: {}", call_id, e);
            }
        }

        match cause {
            Error::Cancelled(_) => self.store.end(),
            other => self.store.fail_start(other.to_string()),
        }
        self.hangup.reset();
    }

    /// Mute or unmute the camera
    pub async fn toggle_camera(&mut self, enabled: bool) -> Result<()> {
        let group_id = self.active_group()?;

        self.media.set_video_enabled(enabled);
        self.store.set_local_video(enabled);

        if let Err(e) = self.signaling.toggle_group_camera(&group_id, enabled).await {
            warn!("Failed to announce camera toggle: {}", e);
        }
        Ok(())
    }

    /// Mute or unmute the microphone
    pub async fn toggle_microphone(&mut self, enabled: bool) -> Result<()> {
        let group_id = self.active_group()?;

        self.media.set_audio_enabled(enabled);
        self.store.set_local_audio(enabled);

        if let Err(e) = self.signaling.toggle_group_microphone(&group_id, enabled).await {
            warn!("Failed to announce microphone toggle: {}", e);
        }
        Ok(())
    }

    /// Process one inbound hub event
    ///
    /// Per-peer failures are contained here: the affected participant is
    /// dropped and the call continues.
    pub async fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::IncomingGroupCall(call) => self.on_incoming(call),
            HubEvent::GroupCallAnswered(answered) => self.on_answered(answered).await,
            HubEvent::GroupIceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            HubEvent::GroupCallEnded(gone) | HubEvent::GroupCallRejected(gone) => {
                self.on_participant_gone(&gone.identity).await
            }
            HubEvent::GroupCameraToggle(toggle) => {
                if self.in_session() {
                    self.store.set_participant_video(&toggle.identity, toggle.enabled);
                }
            }
            HubEvent::GroupMicrophoneToggle(toggle) => {
                if self.in_session() {
                    self.store.set_participant_audio(&toggle.identity, toggle.enabled);
                }
            }
        }
    }

    fn on_incoming(&mut self, call: IncomingGroupCall) {
        if call.caller_identity == self.local_identity {
            return;
        }

        if self.store.lifecycle() != Lifecycle::Idle {
            info!(
                "Busy: ignoring call {} from {}",
                call.call_id, call.caller_identity
            );
            return;
        }

        if let Some(previous) = self.store.incoming() {
            let previous_caller = previous.caller_identity.clone();
            self.registry.discard_pending(&previous_caller);
        }
        self.joined_while_ringing.clear();

        info!("Incoming {} call from {}", call.kind, call.caller_identity);
        self.store.set_incoming(call);
    }

    async fn on_answered(&mut self, answered: GroupCallAnswered) {
        let Some(session) = self.store.session().cloned() else {
            self.note_joined_while_ringing(&answered);
            return;
        };

        if session.group_id != answered.group_id
            || session.lifecycle != Lifecycle::Active
            || answered.answerer_identity == self.local_identity
        {
            debug!("Ignoring answer from {}", answered.answerer_identity);
            return;
        }

        let answerer = answered.answerer_identity.as_str();
        let payload = &answered.answer_payload;

        let ctx = AnswerContext {
            local_identity: &self.local_identity,
            role: session.role,
            placeholder_claimed: self.placeholder_claimed,
            existing_link: self.registry.get(answerer).map(|link| link.signaling_state()),
        };
        let action = tie_break::resolve(&ctx, answerer, payload);
        debug!("Answer from {} resolved to {:?}", answerer, action);

        if let Err(e) = self.apply_answer_action(&session, answerer, payload, action).await {
            self.peer_failed(answerer, e).await;
        }
    }

    async fn apply_answer_action(
        &mut self,
        session: &CallSession,
        answerer: &str,
        payload: &AnswerPayload,
        action: AnswerAction,
    ) -> Result<()> {
        match action {
            AnswerAction::Ignore(reason) => {
                debug!("Ignoring answer from {}: {:?}", answerer, reason);
            }
            AnswerAction::AnswerTargetedOffer => {
                if self.registry.contains(answerer) {
                    debug!("Replacing stale link to {}", answerer);
                    self.registry.remove(answerer).await?;
                }

                self.registry.ensure(answerer).await?;
                self.registry
                    .set_remote_description(answerer, payload.description())
                    .await?;
                let answer = self.registry.create_answer(answerer).await?;
                self.send_envelope(session, AnswerPayload::targeted(answer, answerer))
                    .await?;
                self.store.add_participant(answerer);
            }
            AnswerAction::ApplyTargetedAnswer | AnswerAction::ApplyAnswer => {
                let applied = self
                    .registry
                    .set_remote_description(answerer, payload.description())
                    .await?;
                if applied {
                    self.store.add_participant(answerer);
                }
            }
            AnswerAction::ClaimPlaceholder => {
                let placeholder = self.placeholder_identity.clone();
                match self.registry.rename(&placeholder, answerer).await {
                    Ok(()) => {}
                    Err(Error::RenameCollision { .. }) => {
                        debug!("{} already has a link; treating answer as duplicate", answerer);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }

                self.placeholder_claimed = true;
                self.store.add_participant(answerer);
                self.registry
                    .set_remote_description(answerer, payload.description())
                    .await?;
            }
            AnswerAction::OfferNewAnswerer | AnswerAction::OriginateOffer => {
                self.offer_to(session, answerer).await?;
            }
            AnswerAction::AwaitOffer => {
                self.store.add_participant(answerer);
            }
        }

        Ok(())
    }

    async fn offer_to(&mut self, session: &CallSession, peer: &str) -> Result<()> {
        self.registry.ensure(peer).await?;
        let offer = self.registry.create_offer(peer).await?;
        self.send_envelope(session, AnswerPayload::targeted(offer, peer))
            .await?;
        self.store.add_participant(peer);
        Ok(())
    }

    fn note_joined_while_ringing(&mut self, answered: &GroupCallAnswered) {
        let member = answered.answerer_identity.as_str();
        let Some(call) = self.store.incoming() else {
            debug!("Ignoring answer from {} while idle", member);
            return;
        };

        if call.group_id != answered.group_id
            || answered.answer_payload.target_identity.is_some()
            || member == call.caller_identity
            || member == self.local_identity
        {
            return;
        }

        debug!("{} joined call {} while it rings here", member, call.call_id);
        self.joined_while_ringing.insert(member.to_string());
    }

    /// Apply the pairing rule to members who answered before we accepted
    ///
    /// Their broadcast answers reached us while we had no session, so neither
    /// side has offered yet.
    async fn pair_with_earlier_joiners(&mut self) {
        let joined = std::mem::take(&mut self.joined_while_ringing);
        let Some(session) = self.store.session().cloned() else {
            return;
        };

        for member in joined {
            if member == session.caller_identity || self.registry.contains(&member) {
                continue;
            }

            if tie_break::originates(&self.local_identity, &member) {
                debug!("Offering to earlier joiner {}", member);
                if let Err(e) = self.offer_to(&session, &member).await {
                    self.peer_failed(&member, e).await;
                }
            } else {
                debug!("Waiting for earlier joiner {} to offer", member);
                self.store.add_participant(&member);
            }
        }
    }

    async fn send_envelope(&self, session: &CallSession, payload: AnswerPayload) -> Result<()> {
        let call_id = session
            .call_id
            .as_deref()
            .ok_or_else(|| Error::InvalidState("call has no id yet".to_string()))?;

        self.signaling
            .answer_group_call(call_id, &session.group_id, session.kind, payload)
            .await
    }

    async fn on_remote_candidate(&mut self, event: GroupIceCandidate) {
        let sender = event.sender_identity.as_str();
        if sender == self.local_identity {
            return;
        }

        if let Some(target) = event.candidate_payload.target_identity.as_deref() {
            if target != self.local_identity {
                return;
            }
        }

        let ringing_from_sender = self
            .store
            .incoming()
            .is_some_and(|call| call.caller_identity == sender);
        let accepts = match self.store.lifecycle() {
            Lifecycle::Idle => ringing_from_sender,
            Lifecycle::Starting | Lifecycle::Active => true,
            Lifecycle::Leaving | Lifecycle::Ended => false,
        };
        if !accepts {
            debug!("Dropping candidate from {}", sender);
            return;
        }

        match self
            .registry
            .add_ice_candidate(sender, event.candidate_payload.ice)
            .await
        {
            Ok(disposition) => debug!("Candidate from {}: {:?}", sender, disposition),
            Err(e) => warn!("Failed to apply candidate from {}: {}", sender, e),
        }
    }

    async fn on_participant_gone(&mut self, identity: &str) {
        if identity == self.local_identity {
            return;
        }

        if self.store.lifecycle() == Lifecycle::Idle {
            self.joined_while_ringing.remove(identity);
            let rang = self
                .store
                .incoming()
                .is_some_and(|call| call.caller_identity == identity);
            if rang {
                info!("Caller {} hung up before we answered", identity);
                self.store.cancel_incoming();
                self.registry.discard_pending(identity);
                self.joined_while_ringing.clear();
            }
            return;
        }

        if self.in_session() {
            info!("{} left the call", identity);
            self.drop_peer(identity).await;
        }
    }

    /// Process one link callback event
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(link) = self.registry.find_by_link_id(&event.link_id) else {
            debug!("Dropping event from discarded link {}", event.link_id);
            return;
        };
        let identity = link.username();

        let Some(session) = self.store.session().cloned() else {
            return;
        };

        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                // Nobody has claimed the placeholder yet, so nobody can be targeted
                let payload = if identity == self.placeholder_identity {
                    CandidatePayload::broadcast(candidate)
                } else {
                    CandidatePayload::targeted(candidate, &identity)
                };

                if let Err(e) = self
                    .signaling
                    .send_group_ice_candidate(&session.group_id, payload)
                    .await
                {
                    warn!("Failed to send candidate for {}: {}", identity, e);
                }
            }
            LinkEventKind::RemoteTrack(track) => {
                debug!("{} track {} from {}", track.kind, track.track_id, identity);
                self.store.add_remote_track(&identity, &track);
            }
            LinkEventKind::StateChanged(state) => self.on_link_state(&identity, state).await,
        }
    }

    async fn on_link_state(&mut self, identity: &str, state: LinkState) {
        debug!("Link to {} is {:?}", identity, state);
        let _ = self.registry.set_link_state(identity, state);
        self.store.set_participant_link_state(identity, state);

        if state.is_terminal() && self.in_session() {
            info!("Link to {} {:?}; dropping participant", identity, state);
            self.drop_peer(identity).await;
        }
    }

    async fn peer_failed(&mut self, identity: &str, error: Error) {
        if error.is_peer_error() {
            warn!("Dropping {} after peer error: {}", identity, error);
            self.drop_peer(identity).await;
        } else {
            warn!("Failed to handle answer from {}: {}", identity, error);
        }
    }

    async fn drop_peer(&mut self, identity: &str) {
        if identity == self.placeholder_identity && !self.placeholder_claimed {
            // Nobody can claim a dead placeholder; answerers get offers of their own
            info!("Placeholder link lost before any answer");
            self.placeholder_claimed = true;
        }

        if self.registry.contains(identity) {
            if let Err(e) = self.registry.remove(identity).await {
                debug!("Link for {} already gone: {}", identity, e);
            }
        }
        self.registry.discard_pending(identity);
        self.store.remove_participant(identity);
    }

    /// Leave any active call; used when the call task stops
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.leave_call().await {
            warn!("Error leaving call during shutdown: {}", e);
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.store.lifecycle() {
            Lifecycle::Idle => Ok(()),
            other => Err(Error::InvalidState(format!(
                "a call is already {:?}",
                other
            ))),
        }
    }

    fn in_session(&self) -> bool {
        matches!(
            self.store.lifecycle(),
            Lifecycle::Starting | Lifecycle::Active
        )
    }

    fn active_group(&self) -> Result<String> {
        match self.store.session() {
            Some(session) if session.lifecycle == Lifecycle::Active => Ok(session.group_id.clone()),
            _ => Err(Error::InvalidState("no active call".to_string())),
        }
    }
}
