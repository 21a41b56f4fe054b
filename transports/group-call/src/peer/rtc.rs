//! webrtc-rs backed peer connections

use super::connection::{
    ConnectionFactory, IceCandidate, LinkState, MediaConnection, RemoteTrackInfo, SdpType,
    SessionDescription, SignalingState,
};
use super::link::LinkEventSink;
use crate::ice::IceServerSet;
use crate::media::{LocalTracks, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Receives remote tracks for rendering, keyed by the link's identity at arrival
pub type RemoteTrackHandler = Arc<dyn Fn(String, Arc<TrackRemote>) + Send + Sync>;

/// Creates [`RtcMediaConnection`]s
#[derive(Default, Clone)]
pub struct RtcConnectionFactory {
    track_handler: Option<RemoteTrackHandler>,
}

impl RtcConnectionFactory {
    /// Create a factory with no remote track consumer
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand every remote track to `handler` in addition to the link event
    pub fn with_track_handler(mut self, handler: RemoteTrackHandler) -> Self {
        self.track_handler = Some(handler);
        self
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        ice_servers: &IceServerSet,
        tracks: &LocalTracks,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn MediaConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.to_rtc_ice_servers(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        for track in tracks.all() {
            let sender = peer_connection
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to add {} track: {}", track.kind(), e))
                })?;

            // RTCP has to be drained for the interceptors to run
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        wire_callbacks(&peer_connection, sink.clone(), self.track_handler.clone());

        debug!(
            "Created peer connection for link {} ({})",
            sink.link_id(),
            sink.current_identity()
        );

        Ok(Arc::new(RtcMediaConnection { peer_connection }))
    }
}

fn wire_callbacks(
    peer_connection: &Arc<RTCPeerConnection>,
    sink: LinkEventSink,
    track_handler: Option<RemoteTrackHandler>,
) {
    let candidate_sink = sink.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };

            match candidate.to_json() {
                Ok(init) => sink.local_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }),
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let track_sink = sink.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = track_sink.clone();
            let handler = track_handler.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };

                info!(
                    "Remote {} track {} from {}",
                    kind,
                    track.id(),
                    sink.current_identity()
                );

                sink.remote_track(RemoteTrackInfo {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                });

                if let Some(handler) = handler {
                    handler(sink.current_identity(), track);
                }
            })
        },
    ));

    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                let state = match state {
                    RTCPeerConnectionState::New => LinkState::New,
                    RTCPeerConnectionState::Connecting => LinkState::Connecting,
                    RTCPeerConnectionState::Connected => LinkState::Connected,
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                    _ => return,
                };
                sink.state_changed(state);
            })
        },
    ));
}

/// [`MediaConnection`] over an `RTCPeerConnection`
pub struct RtcMediaConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcMediaConnection {
    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    async fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))?;

        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl MediaConnection for RtcMediaConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
