use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Recording,
    /// Capture stopped, upload queue draining
    Stopping,
    Stopped,
    Error(String),
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Stopping)
    }
}
