//! Pairwise peer links
//!
//! One link per remote participant, each wrapping a media connection plus the
//! negotiation sub-state the call needs (identity, queued remote candidates,
//! whether a remote description was applied).

pub mod connection;
pub mod link;
pub mod registry;
pub mod rtc;

pub use connection::{
    ConnectionFactory, IceCandidate, LinkState, MediaConnection, RemoteTrackInfo, SdpType,
    SessionDescription, SignalingState,
};
pub use link::{LinkEvent, LinkEventKind, LinkEventSink, LinkIdentity, PeerLink};
pub use registry::{CandidateDisposition, ConnectionRegistry};
pub use rtc::{RemoteTrackHandler, RtcConnectionFactory, RtcMediaConnection};
