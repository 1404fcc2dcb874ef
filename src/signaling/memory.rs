use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::channel::{
    SignalingChannel, SignalingConnection, SignalingEvent, SignalingLink, TransportEvent,
};
use super::message::{AttemptSessionId, ConnectionId, PeerRole, SignalingMessage};
use super::room::RoomRegistry;
use crate::error::{ProctorError, Result};

/// Most recent relayed messages kept for inspection
pub const JOURNAL_CAPACITY: usize = 512;

type EventSender = mpsc::UnboundedSender<SignalingEvent>;
type MessageFilter = Arc<dyn Fn(&SignalingMessage) -> bool + Send + Sync>;

/// A message the relay accepted for delivery
#[derive(Debug, Clone)]
pub struct RelayedMessage {
    pub attempt: AttemptSessionId,
    pub from: ConnectionId,
    pub target: Option<ConnectionId>,
    pub message: SignalingMessage,
    pub delivered: bool,
}

#[derive(Default)]
struct RelayState {
    rooms: RoomRegistry<EventSender>,
    failing_connects: u32,
    connect_attempts: u32,
    filter: Option<MessageFilter>,
    journal: VecDeque<RelayedMessage>,
}

/// In-process relay with the same contract as the WebSocket relay.
///
/// Supports fault injection (dropped transports, refused connects, lost
/// messages) so sessions can be exercised without a network.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `count` connect calls
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Messages for which `filter` returns false are silently lost
    pub fn set_message_filter<F>(&self, filter: F)
    where
        F: Fn(&SignalingMessage) -> bool + Send + Sync + 'static,
    {
        self.lock().filter = Some(Arc::new(filter));
    }

    pub fn clear_message_filter(&self) {
        self.lock().filter = None;
    }

    /// What sessions sent through the relay, oldest first. Only the last
    /// `JOURNAL_CAPACITY` messages are kept.
    pub fn journal(&self) -> Vec<RelayedMessage> {
        self.lock().journal.iter().cloned().collect()
    }

    /// Delivered messages of one kind, e.g. "Offer"
    pub fn delivered(&self, kind: &str) -> Vec<RelayedMessage> {
        self.lock()
            .journal
            .iter()
            .filter(|m| m.delivered && m.message.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn occupants(&self, attempt: &AttemptSessionId) -> Vec<(PeerRole, ConnectionId)> {
        self.lock()
            .rooms
            .occupants(attempt)
            .into_iter()
            .map(|o| (o.role, o.connection_id))
            .collect()
    }

    /// Broadcast from an external producer (violations, submission, expiry)
    pub fn publish(&self, attempt: &AttemptSessionId, message: SignalingMessage) {
        let state = self.lock();
        for occupant in state.rooms.occupants(attempt) {
            let _ = occupant.sink.send(SignalingEvent::Message(message.clone()));
        }
    }

    /// Hard transport loss: the connection is removed from its room, its
    /// owner sees `Disconnected`, the other occupant sees `RoomLeft`
    pub fn drop_transport(&self, attempt: &AttemptSessionId, role: PeerRole) -> bool {
        let mut state = self.lock();
        let Some(connection_id) = state
            .rooms
            .occupants(attempt)
            .into_iter()
            .find(|o| o.role == role)
            .map(|o| o.connection_id)
        else {
            return false;
        };

        if let Some(outcome) = state.rooms.leave(attempt, &connection_id) {
            let _ = outcome
                .left
                .sink
                .send(SignalingEvent::Transport(TransportEvent::Disconnected));
            for occupant in outcome.remaining {
                let _ = occupant.sink.send(SignalingEvent::Message(SignalingMessage::RoomLeft {
                    connection_id: connection_id.clone(),
                }));
            }
        }
        tracing::info!(attempt_id = %attempt, role = ?role, "Dropped relay transport");
        true
    }

    /// Transient transport blip that the channel recovers from by itself
    pub fn interrupt_transport(&self, attempt: &AttemptSessionId, role: PeerRole) -> bool {
        let state = self.lock();
        let Some(occupant) = state
            .rooms
            .occupants(attempt)
            .into_iter()
            .find(|o| o.role == role)
        else {
            return false;
        };
        let _ = occupant
            .sink
            .send(SignalingEvent::Transport(TransportEvent::Reconnecting));
        let _ = occupant
            .sink
            .send(SignalingEvent::Transport(TransportEvent::Connected));
        true
    }

    fn route(
        &self,
        attempt: &AttemptSessionId,
        from: &ConnectionId,
        target: Option<&ConnectionId>,
        message: SignalingMessage,
    ) {
        let mut state = self.lock();
        let allowed = state.filter.as_ref().map_or(true, |filter| filter(&message));
        let recipients = if allowed {
            state.rooms.route(attempt, from, target)
        } else {
            Vec::new()
        };

        for occupant in &recipients {
            let _ = occupant.sink.send(SignalingEvent::Message(message.clone()));
        }

        if !allowed {
            tracing::debug!(kind = message.kind(), "Relay dropped message");
        }

        if state.journal.len() == JOURNAL_CAPACITY {
            state.journal.pop_front();
        }
        state.journal.push_back(RelayedMessage {
            attempt: attempt.clone(),
            from: from.clone(),
            target: target.cloned(),
            message,
            delivered: !recipients.is_empty(),
        });
    }

    fn leave(&self, attempt: &AttemptSessionId, connection_id: &ConnectionId) {
        let mut state = self.lock();
        if let Some(outcome) = state.rooms.leave(attempt, connection_id) {
            for occupant in outcome.remaining {
                let _ = occupant.sink.send(SignalingEvent::Message(SignalingMessage::RoomLeft {
                    connection_id: connection_id.clone(),
                }));
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for MemoryRelay {
    async fn connect(&self, attempt: &AttemptSessionId, role: PeerRole) -> Result<SignalingConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::generate();

        {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(ProctorError::SignalingConnect("relay refused connection".into()));
            }

            let outcome = state
                .rooms
                .join(attempt, role, connection_id.clone(), tx.clone());

            if let Some(displaced) = outcome.displaced {
                let _ = displaced
                    .sink
                    .send(SignalingEvent::Transport(TransportEvent::Disconnected));
                for occupant in &outcome.existing {
                    let _ = occupant.sink.send(SignalingEvent::Message(SignalingMessage::RoomLeft {
                        connection_id: displaced.connection_id.clone(),
                    }));
                }
            }

            let _ = tx.send(SignalingEvent::Transport(TransportEvent::Connected));
            for occupant in &outcome.existing {
                let _ = occupant.sink.send(SignalingEvent::Message(SignalingMessage::RoomJoined {
                    role,
                    connection_id: connection_id.clone(),
                }));
                let _ = tx.send(SignalingEvent::Message(SignalingMessage::RoomJoined {
                    role: occupant.role,
                    connection_id: occupant.connection_id.clone(),
                }));
            }
        }

        let link = MemoryLink {
            relay: self.clone(),
            attempt: attempt.clone(),
            connection_id,
            closed: AtomicBool::new(false),
        };

        Ok(SignalingConnection {
            link: Arc::new(link),
            events: rx,
        })
    }
}

struct MemoryLink {
    relay: MemoryRelay,
    attempt: AttemptSessionId,
    connection_id: ConnectionId,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingLink for MemoryLink {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn send(&self, message: SignalingMessage, target: Option<&ConnectionId>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProctorError::SignalingClosed);
        }
        self.relay
            .route(&self.attempt, &self.connection_id, target, message);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.relay.leave(&self.attempt, &self.connection_id);
    }
}
