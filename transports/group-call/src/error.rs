//! Error types for group call orchestration

/// Result type alias using group call Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running a group call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local audio/video tracks could not be opened
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    /// ICE credential endpoint failed (recovered with the fallback STUN entry)
    #[error("ICE server fetch failed: {0}")]
    IceServerFetchFailed(String),

    /// No peer link registered under this identity
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Outbound hub RPC failed or was rejected
    #[error("Signaling RPC failed: {0}")]
    SignalingRpcFailed(String),

    /// Rename target already owns a link
    #[error("Rename collision: {from} -> {to}")]
    RenameCollision {
        /// Identity the link is currently registered under
        from: String,
        /// Identity that already has a link
        to: String,
    },

    /// Mesh already holds the configured maximum number of links
    #[error("Maximum peer limit reached ({0})")]
    PeerLimitReached(u32),

    /// Command not valid for the current call lifecycle
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// User hung up while a start/accept step was suspended
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error only affects a single peer link
    ///
    /// Peer errors drop one participant tile and never end the call.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::LinkNotFound(_)
                | Error::RenameCollision { .. }
                | Error::PeerLimitReached(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
        )
    }

    /// Check if this error aborts session establishment
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisitionFailed(_)
                | Error::SignalingRpcFailed(_)
                | Error::Cancelled(_)
                | Error::WebRtcError(_)
        )
    }
}
