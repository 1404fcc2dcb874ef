use serde::{Deserialize, Serialize};

use super::message::{AttemptSessionId, ConnectionId, PeerRole, SignalingMessage};

/// Frames a session sends to the WebSocket relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Join {
        attempt_id: AttemptSessionId,
        role: PeerRole,
    },

    #[serde(rename_all = "camelCase")]
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        message: SignalingMessage,
    },

    Leave,
}

/// Frames the relay sends to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RelayFrame {
    #[serde(rename_all = "camelCase")]
    Welcome { connection_id: ConnectionId },

    Message { message: SignalingMessage },

    Error { reason: String },
}
