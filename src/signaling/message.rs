use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exam attempt identity; scopes one signaling room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptSessionId(String);

impl AttemptSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned identity of one signaling connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(format!("conn-{:016x}", rng.gen::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Candidate,
    Proctor,
}

impl PeerRole {
    pub fn counterpart(self) -> Self {
        match self {
            PeerRole::Candidate => PeerRole::Proctor,
            PeerRole::Proctor => PeerRole::Candidate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Candidate => "candidate",
            PeerRole::Proctor => "proctor",
        }
    }
}

impl std::str::FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "candidate" | "student" => Ok(PeerRole::Candidate),
            "proctor" => Ok(PeerRole::Proctor),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Serialized ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Courtesy status one side reports to the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationEvent {
    pub id: String,
    pub attempt_id: AttemptSessionId,
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub occurred_at: String,
    pub severity: String,
}

/// Every message carried by the relay. The relay forwards these verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        role: PeerRole,
        connection_id: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    RoomLeft { connection_id: ConnectionId },

    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: String,
        from_connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiation_id: Option<u64>,
        #[serde(default)]
        ice_restart: bool,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        sdp: String,
        from_connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiation_id: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        payload: IceCandidatePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_connection_id: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_connection_id: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiation_id: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    RenegotiationRequested {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_connection_id: Option<ConnectionId>,
    },

    ConnectionStatus { status: LinkStatus },

    ViolationEvent(ViolationEvent),

    #[serde(rename_all = "camelCase")]
    ExamSubmitted { attempt_id: AttemptSessionId },

    #[serde(rename_all = "camelCase")]
    AttemptExpired {
        attempt_id: AttemptSessionId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SignalingMessage {
    /// Short name used in logs and assertions
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::RoomJoined { .. } => "RoomJoined",
            SignalingMessage::RoomLeft { .. } => "RoomLeft",
            SignalingMessage::Offer { .. } => "Offer",
            SignalingMessage::Answer { .. } => "Answer",
            SignalingMessage::IceCandidate { .. } => "IceCandidate",
            SignalingMessage::RenegotiationRequested { .. } => "RenegotiationRequested",
            SignalingMessage::ConnectionStatus { .. } => "ConnectionStatus",
            SignalingMessage::ViolationEvent(_) => "ViolationEvent",
            SignalingMessage::ExamSubmitted { .. } => "ExamSubmitted",
            SignalingMessage::AttemptExpired { .. } => "AttemptExpired",
        }
    }

    /// Broadcasts from external producers that the viewer passes through
    pub fn is_session_control(&self) -> bool {
        matches!(
            self,
            SignalingMessage::ViolationEvent(_)
                | SignalingMessage::ExamSubmitted { .. }
                | SignalingMessage::AttemptExpired { .. }
        )
    }
}
