use thiserror::Error;

/// Error types for the proctoring transport
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Signaling transport errors
    #[error("Failed to connect to signaling relay: {0}")]
    SignalingConnect(String),

    #[error("Failed to send signaling message: {0}")]
    SignalingSend(String),

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Negotiation errors
    #[error("Stale handshake: {0}")]
    StaleHandshake(String),

    #[error("Invalid negotiation state: {0}")]
    InvalidNegotiationState(String),

    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    /// Media and capability errors
    #[error("No supported recording encoding among {0:?}")]
    NoSupportedEncoding(Vec<String>),

    #[error("Media source unavailable: {0}")]
    MediaSourceUnavailable(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),

    /// Upload errors
    #[error("Segment {index} dropped after {attempts} attempts")]
    SegmentDropped { index: u64, attempts: u32 },

    #[error("Segment upload failed with status {0}")]
    UploadRejected(u16),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// Lifecycle errors
    #[error("Session already started")]
    AlreadyStarted,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Network errors
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    /// Helper to create WebRTC API errors
    pub fn webrtc_api(msg: impl Into<String>) -> Self {
        ProctorError::WebRtcApi(msg.into())
    }

    /// Helper to create network errors
    pub fn network(msg: impl Into<String>) -> Self {
        ProctorError::NetworkError(msg.into())
    }

    /// Transient errors that a retry loop may recover from. Every HTTP
    /// outcome counts, local failures such as a malformed upload do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProctorError::SignalingConnect(_)
                | ProctorError::SignalingSend(_)
                | ProctorError::SignalingClosed
                | ProctorError::UploadRejected(_)
                | ProctorError::NetworkError(_)
                | ProctorError::Timeout(_)
        )
    }
}

impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}

impl From<reqwest::Error> for ProctorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProctorError::Timeout(err.to_string())
        } else {
            ProctorError::NetworkError(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProctorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProctorError::SignalingConnect(err.to_string())
    }
}
