//! Hub wire types
//!
//! JSON-RPC 2.0 framing plus the group-call envelopes carried inside it.
//! Outbound RPCs are requests with numeric ids; inbound hub events are
//! notifications whose `method` is the event name and whose `params` is the
//! event body.

use crate::peer::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound RPC method names
pub mod methods {
    /// Broadcast the caller's offer to the group; resolves with the call id
    pub const CALL_GROUP: &str = "callGroup";
    /// Answer (or offer, when targeted) within a call
    pub const ANSWER_GROUP_CALL: &str = "answerGroupCall";
    /// Trickle a local ICE candidate
    pub const SEND_GROUP_ICE_CANDIDATE: &str = "sendGroupIceCandidate";
    /// Decline a ringing call
    pub const REJECT_GROUP_CALL: &str = "rejectGroupCall";
    /// Leave the call
    pub const END_GROUP_CALL: &str = "endGroupCall";
    /// Announce a camera toggle
    pub const TOGGLE_GROUP_CAMERA: &str = "toggleGroupCamera";
    /// Announce a microphone toggle
    pub const TOGGLE_GROUP_MICROPHONE: &str = "toggleGroupMicrophone";
}

/// Inbound hub event names
pub mod events {
    pub const INCOMING_GROUP_CALL: &str = "incoming_group_call";
    pub const GROUP_CALL_ANSWERED: &str = "group_call_answered";
    pub const GROUP_ICE_CANDIDATE: &str = "group_ice_candidate";
    pub const GROUP_CALL_ENDED: &str = "group_call_ended";
    pub const GROUP_CALL_REJECTED: &str = "group_call_rejected";
    pub const GROUP_CAMERA_TOGGLE: &str = "group_camera_toggle";
    pub const GROUP_MICROPHONE_TOGGLE: &str = "group_microphone_toggle";
}

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request, or a notification when `id` is absent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: serde_json::Value,

    /// Request ID this response corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any frame the hub may send
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Notification (or a request, which the client does not serve)
    Request(JsonRpcRequest),
    /// Successful RPC reply
    Response(JsonRpcResponse),
    /// Failed RPC reply
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Parse a text frame
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize JSON-RPC message: {}", e))
        })
    }
}

impl JsonRpcRequest {
    /// Create a request expecting a reply
    pub fn new(method: &str, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(serde_json::Value::from(id)),
        }
    }

    /// Create a notification
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC response: {}", e))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: &str, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message: message.to_string(),
                data: None,
            },
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}

/// Media kind of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio only
    Audio,
    /// Audio and camera
    Video,
}

impl CallKind {
    /// Whether a camera track is needed
    pub fn wants_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Audio => write!(f, "audio"),
            CallKind::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for CallKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(CallKind::Audio),
            "video" => Ok(CallKind::Video),
            other => Err(Error::InvalidConfig(format!("Unknown call kind: {}", other))),
        }
    }
}

/// SDP envelope of `answerGroupCall`
///
/// Untargeted envelopes reach every member of the call; a target identity
/// makes it a point-to-point message over the same broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP
    pub sdp: String,

    /// Intended recipient, if any
    #[serde(
        rename = "_targetIdentity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_identity: Option<String>,
}

impl AnswerPayload {
    /// Envelope addressed to every call member
    pub fn broadcast(description: SessionDescription) -> Self {
        Self {
            sdp_type: description.sdp_type,
            sdp: description.sdp,
            target_identity: None,
        }
    }

    /// Envelope addressed to one member
    pub fn targeted(description: SessionDescription, target: &str) -> Self {
        Self {
            sdp_type: description.sdp_type,
            sdp: description.sdp,
            target_identity: Some(target.to_string()),
        }
    }

    /// The carried description
    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.sdp_type,
            sdp: self.sdp.clone(),
        }
    }
}

/// ICE envelope of `sendGroupIceCandidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// The candidate
    pub ice: IceCandidate,

    /// Intended recipient, if any
    #[serde(
        rename = "_targetIdentity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_identity: Option<String>,
}

impl CandidatePayload {
    /// Envelope addressed to every call member
    pub fn broadcast(ice: IceCandidate) -> Self {
        Self {
            ice,
            target_identity: None,
        }
    }

    /// Envelope addressed to one member
    pub fn targeted(ice: IceCandidate, target: &str) -> Self {
        Self {
            ice,
            target_identity: Some(target.to_string()),
        }
    }
}

/// Params of `callGroup`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallGroupParams {
    pub group_id: String,
    pub kind: CallKind,
    pub offer: SessionDescription,
}

/// Result of `callGroup`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallGroupResult {
    /// Hub-assigned call id
    pub call_id: String,
}

/// Params of `answerGroupCall`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerGroupCallParams {
    pub call_id: String,
    pub group_id: String,
    pub kind: CallKind,
    pub answer_payload: AnswerPayload,
}

/// Params of `sendGroupIceCandidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupIceCandidateParams {
    pub group_id: String,
    pub candidate_payload: CandidatePayload,
}

/// Params of `rejectGroupCall` and `endGroupCall`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRefParams {
    pub call_id: String,
    pub group_id: String,
}

/// Params of `toggleGroupCamera` and `toggleGroupMicrophone`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleParams {
    pub group_id: String,
    pub enabled: bool,
}

/// A call ringing on this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingGroupCall {
    /// Hub-assigned call id
    pub call_id: String,

    /// Group the call belongs to
    pub group_id: String,

    /// Identity of the caller
    pub caller_identity: String,

    /// Audio or video
    pub kind: CallKind,

    /// The caller's broadcast offer
    pub offer: SessionDescription,
}

/// Body of `group_call_answered`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCallAnswered {
    pub answerer_identity: String,
    pub group_id: String,
    pub answer_payload: AnswerPayload,
}

/// Body of `group_ice_candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupIceCandidate {
    pub sender_identity: String,
    pub candidate_payload: CandidatePayload,
}

/// Body of `group_call_ended` and `group_call_rejected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantGone {
    pub identity: String,
}

/// Body of `group_camera_toggle` and `group_microphone_toggle`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaToggle {
    pub identity: String,
    pub enabled: bool,
}

/// Inbound hub event
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    IncomingGroupCall(IncomingGroupCall),
    GroupCallAnswered(GroupCallAnswered),
    GroupIceCandidate(GroupIceCandidate),
    GroupCallEnded(ParticipantGone),
    GroupCallRejected(ParticipantGone),
    GroupCameraToggle(MediaToggle),
    GroupMicrophoneToggle(MediaToggle),
}

fn params<T: DeserializeOwned>(method: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::SerializationError(format!("Invalid {} params: {}", method, e)))
}

impl HubEvent {
    /// Decode a notification; unknown methods yield `Ok(None)`
    pub fn from_notification(method: &str, value: serde_json::Value) -> Result<Option<Self>> {
        let event = match method {
            events::INCOMING_GROUP_CALL => HubEvent::IncomingGroupCall(params(method, value)?),
            events::GROUP_CALL_ANSWERED => HubEvent::GroupCallAnswered(params(method, value)?),
            events::GROUP_ICE_CANDIDATE => HubEvent::GroupIceCandidate(params(method, value)?),
            events::GROUP_CALL_ENDED => HubEvent::GroupCallEnded(params(method, value)?),
            events::GROUP_CALL_REJECTED => HubEvent::GroupCallRejected(params(method, value)?),
            events::GROUP_CAMERA_TOGGLE => HubEvent::GroupCameraToggle(params(method, value)?),
            events::GROUP_MICROPHONE_TOGGLE => {
                HubEvent::GroupMicrophoneToggle(params(method, value)?)
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Event name on the wire
    pub fn method_name(&self) -> &'static str {
        match self {
            HubEvent::IncomingGroupCall(_) => events::INCOMING_GROUP_CALL,
            HubEvent::GroupCallAnswered(_) => events::GROUP_CALL_ANSWERED,
            HubEvent::GroupIceCandidate(_) => events::GROUP_ICE_CANDIDATE,
            HubEvent::GroupCallEnded(_) => events::GROUP_CALL_ENDED,
            HubEvent::GroupCallRejected(_) => events::GROUP_CALL_REJECTED,
            HubEvent::GroupCameraToggle(_) => events::GROUP_CAMERA_TOGGLE,
            HubEvent::GroupMicrophoneToggle(_) => events::GROUP_MICROPHONE_TOGGLE,
        }
    }

    /// Encode as a notification frame
    pub fn to_notification(&self) -> Result<JsonRpcRequest> {
        let value = match self {
            HubEvent::IncomingGroupCall(body) => serde_json::to_value(body),
            HubEvent::GroupCallAnswered(body) => serde_json::to_value(body),
            HubEvent::GroupIceCandidate(body) => serde_json::to_value(body),
            HubEvent::GroupCallEnded(body) | HubEvent::GroupCallRejected(body) => {
                serde_json::to_value(body)
            }
            HubEvent::GroupCameraToggle(body) | HubEvent::GroupMicrophoneToggle(body) => {
                serde_json::to_value(body)
            }
        }
        .map_err(|e| {
            Error::SerializationError(format!("Failed to serialize {}: {}", self.method_name(), e))
        })?;

        Ok(JsonRpcRequest::notification(self.method_name(), value))
    }
}
