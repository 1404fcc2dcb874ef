use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse session health as observed by the owner of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    /// Publisher terminal state
    Failed,
    /// Viewer terminal state
    Offline,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Offline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
