//! Peer connection seam
//!
//! [`MediaConnection`] is the negotiation surface the registry drives for one
//! pairwise link; [`ConnectionFactory`] creates connections with the call's ICE
//! servers and local tracks and wires their callbacks into a
//! [`LinkEventSink`](super::link::LinkEventSink).

use super::link::LinkEventSink;
use crate::ice::IceServerSet;
use crate::media::{LocalTracks, TrackKind};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the originating side
    Offer,
    /// Answer to a received offer
    Answer,
}

/// Session description exchanged through the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate (RTCIceCandidateInit wire shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Offer/answer negotiation state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No negotiation in progress
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet created
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// Transport state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Created, not yet connecting
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
    /// Closed locally or remotely
    Closed,
}

impl LinkState {
    /// Whether the transport reached a state that drops the participant
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

/// Remote track announced by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    /// Remote track id
    pub track_id: String,

    /// Remote stream id
    pub stream_id: String,

    /// Media kind
    pub kind: TrackKind,
}

/// Negotiation surface of one pairwise connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current negotiation state
    fn signaling_state(&self) -> SignalingState;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates connections for new peer links
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection attached to `tracks` and reporting through `sink`
    async fn create(
        &self,
        ice_servers: &IceServerSet,
        tracks: &LocalTracks,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaConnection>>;
}
