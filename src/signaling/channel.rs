use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::message::{AttemptSessionId, ConnectionId, PeerRole, SignalingMessage};
use crate::error::Result;

/// Transport-level notices, distinct from room events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    Transport(TransportEvent),
}

/// One joined signaling connection
#[async_trait]
pub trait SignalingLink: Send + Sync {
    fn connection_id(&self) -> &ConnectionId;

    /// Unicast when `target` is given, otherwise broadcast to the room
    async fn send(&self, message: SignalingMessage, target: Option<&ConnectionId>) -> Result<()>;

    /// Leave the room and close the transport. Safe to call twice.
    async fn disconnect(&self);
}

pub struct SignalingConnection {
    pub link: Arc<dyn SignalingLink>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Room-scoped message bus keyed by attempt identity.
///
/// Joining delivers `RoomJoined` to the existing occupant and, on the joiner's
/// own event stream, one `RoomJoined` per occupant already present. Delivery is
/// best effort: callers must tolerate lost messages.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self, attempt: &AttemptSessionId, role: PeerRole) -> Result<SignalingConnection>;
}
