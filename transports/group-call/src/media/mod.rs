//! Local media tracks
//!
//! Capture and encoding run on the platform pipeline; this module only owns the
//! outgoing track handles that the pipeline writes samples into and that every
//! peer link attaches.

pub mod source;

pub use source::{
    LocalMediaSource, LocalTrack, LocalTracks, MediaDevices, StaticSampleDevices, TrackKind,
};
