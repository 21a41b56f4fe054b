//! Signaling hub access
//!
//! The hub is a reliable, ordered pub/sub + RPC channel shared by every member
//! of a group. [`SignalingClient`] is the outbound RPC surface; inbound events
//! arrive as [`HubEvent`]s on a channel owned by the call task.

pub mod protocol;
pub mod websocket;

pub use protocol::{
    AnswerPayload, CallKind, CandidatePayload, GroupCallAnswered, GroupIceCandidate, HubEvent,
    IncomingGroupCall, MediaToggle, ParticipantGone,
};
pub use websocket::WsSignalingClient;

use crate::peer::SessionDescription;
use crate::Result;
use async_trait::async_trait;

/// Outbound hub RPCs
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Broadcast the caller's offer to `group_id`; returns the new call id
    async fn call_group(
        &self,
        group_id: &str,
        kind: CallKind,
        offer: SessionDescription,
    ) -> Result<String>;

    /// Send an SDP envelope within a call
    async fn answer_group_call(
        &self,
        call_id: &str,
        group_id: &str,
        kind: CallKind,
        payload: AnswerPayload,
    ) -> Result<()>;

    /// Trickle a local ICE candidate
    async fn send_group_ice_candidate(
        &self,
        group_id: &str,
        payload: CandidatePayload,
    ) -> Result<()>;

    /// Decline a ringing call
    async fn reject_group_call(&self, call_id: &str, group_id: &str) -> Result<()>;

    /// Leave a call
    async fn end_group_call(&self, call_id: &str, group_id: &str) -> Result<()>;

    /// Announce the local camera flag
    async fn toggle_group_camera(&self, group_id: &str, enabled: bool) -> Result<()>;

    /// Announce the local microphone flag
    async fn toggle_group_microphone(&self, group_id: &str, enabled: bool) -> Result<()>;
}
