use std::sync::Arc;
use tokio::sync::mpsc;

use super::supervisor::{ReconnectPolicy, ReconnectSupervisor};
use crate::error::Result;
use crate::signaling::{
    AttemptSessionId, ConnectionId, PeerRole, SignalingChannel, SignalingEvent, SignalingLink,
    SignalingMessage,
};

/// A session's exclusive signaling handle, replaced wholesale on reconnect
pub(crate) struct SignalingSlot {
    channel: Arc<dyn SignalingChannel>,
    attempt: AttemptSessionId,
    role: PeerRole,
    link: Option<Arc<dyn SignalingLink>>,
    events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    pub supervisor: ReconnectSupervisor,
}

impl SignalingSlot {
    pub async fn open(
        channel: Arc<dyn SignalingChannel>,
        attempt: AttemptSessionId,
        role: PeerRole,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let mut slot = Self {
            channel,
            attempt,
            role,
            link: None,
            events: None,
            supervisor: ReconnectSupervisor::new(policy),
        };
        slot.connect().await?;
        Ok(slot)
    }

    pub fn attempt(&self) -> &AttemptSessionId {
        &self.attempt
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(|link| link.connection_id().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Next event from the current connection. Pending while disconnected;
    /// `None` once the current connection's stream has ended.
    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        let connection = self.channel.connect(&self.attempt, self.role).await?;
        tracing::info!(
            attempt_id = %self.attempt,
            role = ?self.role,
            connection_id = %connection.link.connection_id(),
            "Joined signaling room"
        );
        self.link = Some(connection.link);
        self.events = Some(connection.events);
        Ok(())
    }

    /// Send failures are transient; they are logged and the message is lost
    pub async fn send(&self, message: SignalingMessage, target: Option<&ConnectionId>) {
        let Some(link) = &self.link else {
            tracing::debug!(kind = message.kind(), "No signaling connection, message not sent");
            return;
        };
        let kind = message.kind();
        if let Err(e) = link.send(message, target).await {
            tracing::warn!(attempt_id = %self.attempt, kind, error = %e, "Failed to send signaling message");
        }
    }

    /// Drop the current connection, leaving the room if it is still joined
    pub async fn disconnect(&mut self) {
        self.events = None;
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
    }
}
