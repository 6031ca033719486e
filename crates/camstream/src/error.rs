//! Error types for the streaming engine

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, starting or capturing a stream
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Live-view credential fetch failed (bad HTTP status or malformed body)
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(String),

    /// Signaling channel error or unexpected close before the peer connected
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Establishment deadline exceeded before reaching a connected state
    #[error("Negotiation timed out after {0:?}")]
    NegotiationTimeout(std::time::Duration),

    /// Transcoder failed before its first output was observed
    #[error("Transcoder failed to start: {0}")]
    TranscoderSpawn(String),

    /// Transcoder exited after the stream was reported started
    #[error("Transcoder exited: {0}")]
    TranscoderExit(String),

    /// Camera reports a backend this engine cannot serve
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Session not found (never prepared, or already started)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session management error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Session was stopped while it was still starting
    #[error("Session stopped during start: {0}")]
    SessionStopped(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Managed room SDK error
    #[error("Room error: {0}")]
    RoomError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CredentialFetch(_)
                | Error::Signaling(_)
                | Error::NegotiationTimeout(_)
                | Error::WebSocketError(_)
                | Error::RoomError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::UnsupportedProvider(_))
    }

    /// Check if this error happened before the stream was reported started
    pub fn is_start_failure(&self) -> bool {
        !matches!(self, Error::TranscoderExit(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
