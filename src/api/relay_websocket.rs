use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use warp::ws::{Message, WebSocket};

use crate::signaling::{
    AttemptSessionId, ClientFrame, ConnectionId, PeerRole, RelayFrame, RoomRegistry,
    SignalingMessage,
};

type ClientSender = mpsc::UnboundedSender<Message>;

/// Room membership shared by every relay WebSocket
#[derive(Clone, Default)]
pub struct RelayHub {
    rooms: Arc<RwLock<RoomRegistry<ClientSender>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and exchange `RoomJoined` with whoever is
    /// already in the room. An older occupant with the same role is told it
    /// was displaced and closed.
    pub async fn join(
        &self,
        attempt: &AttemptSessionId,
        role: PeerRole,
        sender: ClientSender,
    ) -> ConnectionId {
        let connection_id = ConnectionId::generate();
        let mut rooms = self.rooms.write().await;
        let outcome = rooms.join(attempt, role, connection_id.clone(), sender.clone());

        send_frame(
            &sender,
            &RelayFrame::Welcome {
                connection_id: connection_id.clone(),
            },
        );

        if let Some(displaced) = outcome.displaced {
            send_frame(
                &displaced.sink,
                &RelayFrame::Error {
                    reason: "displaced by a newer connection".to_string(),
                },
            );
            let _ = displaced.sink.send(Message::close());
            for occupant in &outcome.existing {
                send_message(
                    &occupant.sink,
                    SignalingMessage::RoomLeft {
                        connection_id: displaced.connection_id.clone(),
                    },
                );
            }
        }

        for occupant in &outcome.existing {
            send_message(
                &occupant.sink,
                SignalingMessage::RoomJoined {
                    role,
                    connection_id: connection_id.clone(),
                },
            );
            send_message(
                &sender,
                SignalingMessage::RoomJoined {
                    role: occupant.role,
                    connection_id: occupant.connection_id.clone(),
                },
            );
        }

        connection_id
    }

    /// Forward verbatim; returns how many occupants received it
    pub async fn route(
        &self,
        attempt: &AttemptSessionId,
        from: &ConnectionId,
        target: Option<&ConnectionId>,
        message: SignalingMessage,
    ) -> usize {
        let rooms = self.rooms.read().await;
        let recipients = rooms.route(attempt, from, target);
        for occupant in &recipients {
            send_message(&occupant.sink, message.clone());
        }
        if recipients.is_empty() {
            tracing::debug!(
                attempt_id = %attempt,
                kind = message.kind(),
                target = ?target.map(ConnectionId::as_str),
                "No recipient for relayed message"
            );
        }
        recipients.len()
    }

    pub async fn leave(&self, attempt: &AttemptSessionId, connection_id: &ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(outcome) = rooms.leave(attempt, connection_id) {
            for occupant in outcome.remaining {
                send_message(
                    &occupant.sink,
                    SignalingMessage::RoomLeft {
                        connection_id: connection_id.clone(),
                    },
                );
            }
        }
    }

    /// External producers (violation feed, submission, expiry)
    pub async fn publish(&self, attempt: &AttemptSessionId, message: SignalingMessage) -> usize {
        let rooms = self.rooms.read().await;
        let occupants = rooms.occupants(attempt);
        for occupant in &occupants {
            send_message(&occupant.sink, message.clone());
        }
        occupants.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.room_count()
    }
}

fn send_frame(sender: &ClientSender, frame: &RelayFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = sender.send(Message::text(text));
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize relay frame"),
    }
}

fn send_message(sender: &ClientSender, message: SignalingMessage) {
    send_frame(sender, &RelayFrame::Message { message });
}

/// Membership of one socket, set by its `join` frame
struct Membership {
    attempt: AttemptSessionId,
    connection_id: ConnectionId,
}

pub async fn handle_relay_websocket(websocket: WebSocket, hub: RelayHub) {
    tracing::info!("New relay WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut membership: Option<Membership> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                if !handle_client_frame(&hub, &tx, &mut membership, message).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    if let Some(member) = membership.take() {
        hub.leave(&member.attempt, &member.connection_id).await;
    }
    sender_task.abort();
    tracing::info!("Relay WebSocket connection closed");
}

/// Returns false once the socket should be closed
async fn handle_client_frame(
    hub: &RelayHub,
    tx: &ClientSender,
    membership: &mut Option<Membership>,
    message: Message,
) -> bool {
    let Ok(text) = message.to_str() else {
        return true;
    };

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, raw_message = %text, "Failed to parse relay frame");
            send_frame(
                tx,
                &RelayFrame::Error {
                    reason: format!("malformed frame: {}", e),
                },
            );
            return true;
        }
    };

    match (frame, membership.as_ref()) {
        (ClientFrame::Join { attempt_id, role }, None) => {
            let connection_id = hub.join(&attempt_id, role, tx.clone()).await;
            *membership = Some(Membership {
                attempt: attempt_id,
                connection_id,
            });
            true
        }
        (ClientFrame::Join { .. }, Some(_)) => {
            send_frame(
                tx,
                &RelayFrame::Error {
                    reason: "already joined".to_string(),
                },
            );
            true
        }
        (ClientFrame::Send { target, message }, Some(member)) => {
            hub.route(&member.attempt, &member.connection_id, target.as_ref(), message)
                .await;
            true
        }
        (ClientFrame::Send { .. }, None) => {
            send_frame(
                tx,
                &RelayFrame::Error {
                    reason: "join an attempt room first".to_string(),
                },
            );
            true
        }
        (ClientFrame::Leave, _) => false,
    }
}
