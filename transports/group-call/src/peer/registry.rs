//! Connection registry: username → peer link map plus early ICE buffering

use super::connection::{
    ConnectionFactory, IceCandidate, LinkState, SdpType, SessionDescription, SignalingState,
};
use super::link::{LinkEvent, LinkEventSink, LinkIdentity, PeerLink};
use crate::ice::IceServerSet;
use crate::media::LocalTracks;
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where an inbound candidate ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// No link yet; queued under the sender's name
    QueuedForUnknownPeer,
    /// Link exists but has no remote description; queued on the link
    QueuedOnLink,
    /// Applied to the connection
    Applied,
}

/// Owns every peer link of the current call
///
/// Mutated only from the call task, so no interior locking is needed.
pub struct ConnectionRegistry {
    links: HashMap<String, PeerLink>,
    pending: HashMap<String, VecDeque<IceCandidate>>,
    factory: Arc<dyn ConnectionFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
    ice_servers: Option<IceServerSet>,
    local_tracks: Option<LocalTracks>,
    max_peers: u32,
}

impl ConnectionRegistry {
    /// Create a new registry
    ///
    /// # Arguments
    ///
    /// * `factory` - Creates the connection behind each link
    /// * `events` - Channel receiving every link's callback events
    /// * `max_peers` - Maximum simultaneous links
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        events: mpsc::UnboundedSender<LinkEvent>,
        max_peers: u32,
    ) -> Self {
        Self {
            links: HashMap::new(),
            pending: HashMap::new(),
            factory,
            events,
            ice_servers: None,
            local_tracks: None,
            max_peers,
        }
    }

    /// Set the ICE servers and local tracks used for new links
    pub fn prepare(&mut self, ice_servers: IceServerSet, local_tracks: LocalTracks) {
        self.ice_servers = Some(ice_servers);
        self.local_tracks = Some(local_tracks);
    }

    /// Return the link for `username`, creating it if needed
    ///
    /// A new link takes over any candidates queued for `username` before it
    /// existed; they are applied once its remote description is set.
    pub async fn ensure(&mut self, username: &str) -> Result<&PeerLink> {
        if !self.links.contains_key(username) {
            self.create_link(username).await?;
        }

        self.links
            .get(username)
            .ok_or_else(|| Error::LinkNotFound(username.to_string()))
    }

    async fn create_link(&mut self, username: &str) -> Result<()> {
        let (ice_servers, local_tracks) = match (&self.ice_servers, &self.local_tracks) {
            (Some(ice), Some(tracks)) if !tracks.is_empty() => (ice, tracks),
            _ => {
                return Err(Error::InvalidState(
                    "local media must be acquired before creating links".to_string(),
                ))
            }
        };

        if self.links.len() >= self.max_peers as usize {
            return Err(Error::PeerLimitReached(self.max_peers));
        }

        let link_id = uuid::Uuid::new_v4().to_string();
        let identity = LinkIdentity::new(username);
        let sink = LinkEventSink::new(link_id.clone(), identity.clone(), self.events.clone());

        let connection = self
            .factory
            .create(ice_servers, local_tracks, sink.clone())
            .await?;

        let mut link = PeerLink::new(identity, sink, connection);
        if let Some(queued) = self.pending.remove(username) {
            debug!(
                "Moving {} early candidates onto new link for {}",
                queued.len(),
                username
            );
            link.pending_candidates.extend(queued);
        }

        info!("Created link {} for {}", link_id, username);
        self.links.insert(username.to_string(), link);

        Ok(())
    }

    /// Apply a remote description
    ///
    /// An answer arriving while the connection is already stable is a late or
    /// duplicate answer and is ignored; returns whether it was applied.
    pub async fn set_remote_description(
        &mut self,
        username: &str,
        description: SessionDescription,
    ) -> Result<bool> {
        let link = self
            .links
            .get_mut(username)
            .ok_or_else(|| Error::LinkNotFound(username.to_string()))?;

        if description.sdp_type == SdpType::Answer
            && link.connection.signaling_state() == SignalingState::Stable
        {
            debug!("Ignoring answer from {}: link already stable", username);
            return Ok(false);
        }

        link.connection.set_remote_description(description).await?;
        link.has_remote_description = true;

        Self::flush(username, link).await;

        Ok(true)
    }

    /// Route an inbound ICE candidate
    pub async fn add_ice_candidate(
        &mut self,
        username: &str,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition> {
        let Some(link) = self.links.get_mut(username) else {
            self.pending
                .entry(username.to_string())
                .or_default()
                .push_back(candidate);
            return Ok(CandidateDisposition::QueuedForUnknownPeer);
        };

        if !link.has_remote_description {
            link.pending_candidates.push_back(candidate);
            return Ok(CandidateDisposition::QueuedOnLink);
        }

        link.connection.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Create an offer on an existing link
    pub async fn create_offer(&self, username: &str) -> Result<SessionDescription> {
        self.link(username)?.connection.create_offer().await
    }

    /// Create an answer on an existing link
    pub async fn create_answer(&self, username: &str) -> Result<SessionDescription> {
        self.link(username)?.connection.create_answer().await
    }

    /// Move a link to a new identity
    ///
    /// Fails without touching either link if `new` already has one. Candidates
    /// queued under either name end up on the renamed link, old name first.
    pub async fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.links.contains_key(new) {
            return Err(Error::RenameCollision {
                from: old.to_string(),
                to: new.to_string(),
            });
        }

        let mut link = self
            .links
            .remove(old)
            .ok_or_else(|| Error::LinkNotFound(old.to_string()))?;

        for name in [old, new] {
            if let Some(queued) = self.pending.remove(name) {
                link.pending_candidates.extend(queued);
            }
        }

        link.identity.set(new);
        info!("Renamed link {} from {} to {}", link.link_id(), old, new);

        if link.has_remote_description {
            Self::flush(new, &mut link).await;
        }

        self.links.insert(new.to_string(), link);

        Ok(())
    }

    /// Close and forget the link for `username`
    pub async fn remove(&mut self, username: &str) -> Result<()> {
        self.pending.remove(username);

        let link = self
            .links
            .remove(username)
            .ok_or_else(|| Error::LinkNotFound(username.to_string()))?;

        Self::close_link(username, link).await;
        Ok(())
    }

    /// Close every link and drop all queued state
    pub async fn close_all(&mut self) {
        debug!("Closing all {} links", self.links.len());

        for (username, link) in self.links.drain() {
            Self::close_link(&username, link).await;
        }
        self.pending.clear();
        self.ice_servers = None;
        self.local_tracks = None;
    }

    /// Drop candidates queued for a peer that never got a link
    pub fn discard_pending(&mut self, username: &str) -> usize {
        self.pending
            .remove(username)
            .map(|queued| queued.len())
            .unwrap_or(0)
    }

    /// Record a transport state reported by the link
    pub fn set_link_state(&mut self, username: &str, state: LinkState) -> Result<()> {
        let link = self
            .links
            .get_mut(username)
            .ok_or_else(|| Error::LinkNotFound(username.to_string()))?;
        link.state = state;
        Ok(())
    }

    /// Get a link by identity
    pub fn get(&self, username: &str) -> Option<&PeerLink> {
        self.links.get(username)
    }

    /// Get the link backed by connection instance `link_id`
    ///
    /// Callback events name the identity at emit time, which a rename may
    /// have changed since; the link id does not change.
    pub fn find_by_link_id(&self, link_id: &str) -> Option<&PeerLink> {
        self.links.values().find(|link| link.link_id() == link_id)
    }

    /// Check if a link exists
    pub fn contains(&self, username: &str) -> bool {
        self.links.contains_key(username)
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the registry holds no links
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Identities with a link, sorted
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.keys().cloned().collect();
        names.sort();
        names
    }

    /// Candidates queued for a peer without a link
    pub fn pending_for(&self, username: &str) -> usize {
        self.pending.get(username).map(VecDeque::len).unwrap_or(0)
    }

    fn link(&self, username: &str) -> Result<&PeerLink> {
        self.links
            .get(username)
            .ok_or_else(|| Error::LinkNotFound(username.to_string()))
    }

    async fn flush(username: &str, link: &mut PeerLink) {
        let queued = std::mem::take(&mut link.pending_candidates);
        if queued.is_empty() {
            return;
        }

        debug!("Flushing {} queued candidates for {}", queued.len(), username);
        for candidate in queued {
            if let Err(e) = link.connection.add_ice_candidate(candidate).await {
                warn!("Dropping queued candidate for {}: {}", username, e);
            }
        }
    }

    async fn close_link(username: &str, link: PeerLink) {
        link.sink.detach();
        if let Err(e) = link.connection.close().await {
            warn!("Error closing link for {}: {}", username, e);
        }
        info!("Removed link for {}", username);
    }
}
