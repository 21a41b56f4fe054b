//! Local audio/video track acquisition

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Platform device access
///
/// Opening a device yields the outgoing RTP track the capture pipeline feeds.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the device for `kind` and return its outgoing track
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
        stream_id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>>;
}

/// Devices backed by sample-fed static tracks (Opus audio, configured video codec)
#[derive(Debug, Default, Clone)]
pub struct StaticSampleDevices;

#[async_trait]
impl MediaDevices for StaticSampleDevices {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
        stream_id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: constraints.audio_sample_rate,
                channels: constraints.audio_channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: constraints.video_codec.mime_type().to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        Ok(Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{}-{}", kind, uuid::Uuid::new_v4()),
            stream_id.to_string(),
        )))
    }
}

/// One outgoing track with an in-place mute switch
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Wrap an opened track
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>, enabled: bool) -> Self {
        Self {
            kind,
            track,
            enabled: AtomicBool::new(enabled),
            stopped: AtomicBool::new(false),
        }
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Track id
    pub fn id(&self) -> &str {
        self.track.id()
    }

    /// Underlying RTP track, attached to each peer link
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Mute or unmute without renegotiation
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the track has been released
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write an encoded sample from the capture pipeline
    ///
    /// Returns `Ok(false)` when the sample was dropped because the track is
    /// muted or released.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }

        self.track
            .write_sample(sample)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to write {} sample: {}", self.kind, e)))?;

        Ok(true)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Currently held local tracks
#[derive(Clone, Default)]
pub struct LocalTracks {
    /// Microphone track
    pub audio: Option<Arc<LocalTrack>>,
    /// Camera track
    pub video: Option<Arc<LocalTrack>>,
}

impl LocalTracks {
    /// All held tracks, audio first
    pub fn all(&self) -> Vec<Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Whether no track is held
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Owner of the local tracks for one call
pub struct LocalMediaSource {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    stream_id: String,
    tracks: LocalTracks,
    audio_enabled: bool,
    video_enabled: bool,
}

impl LocalMediaSource {
    /// Create a source over the given devices
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            stream_id: format!("stream-{}", uuid::Uuid::new_v4()),
            tracks: LocalTracks::default(),
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Acquire the requested tracks
    ///
    /// Idempotent: tracks already held are returned as-is and only missing
    /// kinds are opened. On failure, tracks opened by this call are released.
    pub async fn acquire(&mut self, want_video: bool, want_audio: bool) -> Result<LocalTracks> {
        let mut opened = Vec::new();

        let requested = [(TrackKind::Audio, want_audio), (TrackKind::Video, want_video)];
        for (kind, wanted) in requested {
            if !wanted || self.slot(kind).is_some() {
                continue;
            }

            match self
                .devices
                .open(kind, &self.constraints, &self.stream_id)
                .await
            {
                Ok(track) => {
                    let enabled = match kind {
                        TrackKind::Audio => self.audio_enabled,
                        TrackKind::Video => self.video_enabled,
                    };
                    let track = Arc::new(LocalTrack::new(kind, track, enabled));
                    debug!("Opened local {} track {}", kind, track.id());
                    *self.slot_mut(kind) = Some(track);
                    opened.push(kind);
                }
                Err(e) => {
                    for opened_kind in opened {
                        if let Some(track) = self.slot_mut(opened_kind).take() {
                            track.stop();
                        }
                    }
                    return Err(Error::MediaAcquisitionFailed(format!(
                        "Failed to open {}: {}",
                        kind, e
                    )));
                }
            }
        }

        if !opened.is_empty() {
            info!("Acquired local media: {:?}", opened);
        }

        Ok(self.tracks.clone())
    }

    /// Stop and free all tracks
    ///
    /// Mute flags return to enabled; the next call starts live.
    pub fn release(&mut self) {
        self.audio_enabled = true;
        self.video_enabled = true;

        let tracks = std::mem::take(&mut self.tracks);
        if tracks.is_empty() {
            return;
        }

        for track in tracks.all() {
            track.stop();
        }
        info!("Released local media");
    }

    /// Tracks currently held
    pub fn tracks(&self) -> LocalTracks {
        self.tracks.clone()
    }

    /// Whether any track is held
    pub fn is_acquired(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Mute/unmute the microphone in place
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        match &self.tracks.audio {
            Some(track) => track.set_enabled(enabled),
            None => warn!("Audio toggled without an audio track"),
        }
    }

    /// Enable/disable the camera in place
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        match &self.tracks.video {
            Some(track) => track.set_enabled(enabled),
            None => debug!("Video toggled without a video track"),
        }
    }

    /// Local microphone flag
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    /// Local camera flag
    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn slot(&self, kind: TrackKind) -> &Option<Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => &self.tracks.audio,
            TrackKind::Video => &self.tracks.video,
        }
    }

    fn slot_mut(&mut self, kind: TrackKind) -> &mut Option<Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => &mut self.tracks.audio,
            TrackKind::Video => &mut self.tracks.video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NoCamera {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl MediaDevices for NoCamera {
        async fn open(
            &self,
            kind: TrackKind,
            constraints: &MediaConstraints,
            stream_id: &str,
        ) -> Result<Arc<TrackLocalStaticSample>> {
            if kind == TrackKind::Video {
                return Err(Error::MediaAcquisitionFailed("camera busy".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            StaticSampleDevices.open(kind, constraints, stream_id).await
        }
    }

    fn source() -> LocalMediaSource {
        LocalMediaSource::new(Arc::new(StaticSampleDevices), MediaConstraints::default())
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let mut media = source();

        let first = media.acquire(true, true).await.unwrap();
        let second = media.acquire(true, true).await.unwrap();

        assert!(Arc::ptr_eq(
            first.audio.as_ref().unwrap(),
            second.audio.as_ref().unwrap()
        ));
        assert!(Arc::ptr_eq(
            first.video.as_ref().unwrap(),
            second.video.as_ref().unwrap()
        ));
        assert_eq!(second.all().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_widens_request() {
        let mut media = source();

        let audio_only = media.acquire(false, true).await.unwrap();
        assert!(audio_only.video.is_none());

        let both = media.acquire(true, true).await.unwrap();
        assert!(both.video.is_some());
        assert!(Arc::ptr_eq(
            audio_only.audio.as_ref().unwrap(),
            both.audio.as_ref().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_failed_acquire_releases_partial_tracks() {
        let devices = Arc::new(NoCamera {
            opened: AtomicUsize::new(0),
        });
        let mut media = LocalMediaSource::new(devices.clone(), MediaConstraints::default());

        let err = media.acquire(true, true).await.err().unwrap();
        assert!(matches!(err, Error::MediaAcquisitionFailed(_)));
        assert_eq!(devices.opened.load(Ordering::SeqCst), 1);
        assert!(!media.is_acquired());
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let mut media = source();
        let tracks = media.acquire(false, true).await.unwrap();
        let audio = tracks.audio.unwrap();

        media.set_audio_enabled(false);
        assert!(!audio.is_enabled());
        assert!(!media.audio_enabled());
        assert!(!audio.write_sample(&Sample::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_stops_tracks() {
        let mut media = source();
        let tracks = media.acquire(true, true).await.unwrap();

        media.release();

        assert!(!media.is_acquired());
        for track in tracks.all() {
            assert!(track.is_stopped());
            assert!(!track.write_sample(&Sample::default()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_mute_before_acquire_applies() {
        let mut media = source();
        media.set_video_enabled(false);

        let tracks = media.acquire(true, false).await.unwrap();
        assert!(!tracks.video.unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_release_resets_mute() {
        let mut media = source();
        media.acquire(true, true).await.unwrap();
        media.set_audio_enabled(false);
        media.set_video_enabled(false);

        media.release();
        assert!(media.audio_enabled());
        assert!(media.video_enabled());

        let tracks = media.acquire(true, true).await.unwrap();
        assert!(tracks.audio.unwrap().is_enabled());
        assert!(tracks.video.unwrap().is_enabled());
    }
}
