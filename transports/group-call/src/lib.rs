//! Mesh group calls over WebRTC
//!
//! This crate runs one client's side of a small group call in which every
//! member holds a direct peer connection to every other member. Calls are
//! brokered through a signaling hub that only broadcasts to a group, so
//! members sort out who connects to whom among themselves.
//!
//! # Features
//!
//! - **Mesh topology**: One peer link per remote participant, capped by `max_peers`
//! - **Broadcast call setup**: Caller offers once, the first answerer claims the offer
//! - **Deterministic pairing**: Later joiners connect by lexicographic identity order
//! - **Trickle ICE**: Candidates arriving before their link exists are queued
//! - **JSON-RPC 2.0 signaling**: WebSocket hub client with request correlation
//! - **Observable state**: Immutable snapshots and one-shot notices for the UI
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  UI                                                      │
//! │  ├─ CallHandle (commands, hang-up)                       │
//! │  └─ CallStoreHandle (snapshots, notices)                 │
//! │     ↓                                                    │
//! │  CallRuntime task                                        │
//! │  └─ GroupCallOrchestrator                                │
//! │     ├─ IceServerProvider (cached credentials)            │
//! │     ├─ LocalMediaSource (outgoing tracks)                │
//! │     ├─ ConnectionRegistry (username → PeerLink)          │
//! │     ├─ SignalingClient (JSON-RPC over WebSocket)         │
//! │     └─ CallSessionStore                                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use group_call::GroupCallConfig;
//!
//! let config = GroupCallConfig::new("alice")
//!     .with_hub_url("ws://localhost:8080")
//!     .with_max_peers(6);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_peers, 6);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use group_call::{
//!     CallKind, CallRuntime, CallServices, GroupCallConfig, GroupCallOrchestrator,
//!     IceServerProvider, RtcConnectionFactory, StaticSampleDevices, WsSignalingClient,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> group_call::Result<()> {
//! let config = GroupCallConfig::new("alice").with_hub_url("ws://localhost:8080");
//! let (signaling, hub_events) = WsSignalingClient::connect(
//!     &config.hub_url,
//!     Duration::from_millis(config.rpc_timeout_ms),
//! )
//! .await?;
//!
//! let services = CallServices {
//!     signaling: Arc::new(signaling),
//!     ice: Arc::new(IceServerProvider::from_config(&config.ice)?),
//!     devices: Arc::new(StaticSampleDevices),
//!     connections: Arc::new(RtcConnectionFactory::new()),
//! };
//! let (orchestrator, link_events) = GroupCallOrchestrator::new(&config, services)?;
//! let (call, _task) = CallRuntime::spawn(orchestrator, link_events, hub_events);
//!
//! call.start_call("team-standup", CallKind::Video).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ice;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod runtime;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{GroupCallConfig, IceConfig, MediaConstraints, TurnServerConfig, VideoCodec};
pub use error::{Error, Result};
pub use ice::{IceCredentialSource, IceServer, IceServerProvider, IceServerSet};
pub use media::{LocalMediaSource, LocalTracks, MediaDevices, StaticSampleDevices, TrackKind};
pub use orchestrator::{CallServices, GroupCallOrchestrator, HangupFlag};
pub use peer::{
    ConnectionFactory, ConnectionRegistry, IceCandidate, LinkState, MediaConnection,
    RtcConnectionFactory, SessionDescription,
};
pub use runtime::{CallHandle, CallRuntime};
pub use session::{CallNotice, CallSnapshot, CallStoreHandle, Lifecycle, Participant};
pub use signaling::{CallKind, HubEvent, IncomingGroupCall, SignalingClient, WsSignalingClient};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
