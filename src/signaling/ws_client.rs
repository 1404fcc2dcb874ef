use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::channel::{
    SignalingChannel, SignalingConnection, SignalingEvent, SignalingLink, TransportEvent,
};
use super::frame::{ClientFrame, RelayFrame};
use super::message::{AttemptSessionId, ConnectionId, PeerRole, SignalingMessage};
use crate::error::{ProctorError, Result};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Signaling channel backed by the WebSocket relay
pub struct WsSignalingChannel {
    relay_url: String,
}

impl WsSignalingChannel {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&self, attempt: &AttemptSessionId, role: PeerRole) -> Result<SignalingConnection> {
        tracing::info!(url = %self.relay_url, attempt_id = %attempt, role = ?role, "Connecting to signaling relay");

        let (ws_stream, _) = connect_async(self.relay_url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let join = serde_json::to_string(&ClientFrame::Join {
            attempt_id: attempt.clone(),
            role,
        })?;
        ws_sender
            .send(Message::Text(join))
            .await
            .map_err(|e| ProctorError::SignalingSend(e.to_string()))?;

        let connection_id = tokio::time::timeout(WELCOME_TIMEOUT, read_welcome(&mut ws_receiver))
            .await
            .map_err(|_| ProctorError::Timeout("waiting for relay welcome".into()))??;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let _ = events_tx.send(SignalingEvent::Transport(TransportEvent::Connected));

        let sender_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sender.send(message).await {
                    tracing::warn!(error = %e, "Failed to write to signaling relay");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_connection_id = connection_id.clone();
        let receiver_task = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => match parse_relay_frame(&text) {
                        Ok(RelayFrame::Message { message }) => {
                            if events_tx.send(SignalingEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                        Ok(RelayFrame::Error { reason }) => {
                            tracing::warn!(reason = %reason, "Relay reported an error");
                        }
                        Ok(RelayFrame::Welcome { .. }) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, raw_message = %text, "Failed to parse relay frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Signaling relay read error");
                        break;
                    }
                }
            }
            tracing::info!(connection_id = %reader_connection_id, "Signaling relay connection lost");
            let _ = events_tx.send(SignalingEvent::Transport(TransportEvent::Disconnected));
        });

        Ok(SignalingConnection {
            link: Arc::new(WsLink {
                connection_id,
                outbound: outbound_tx,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(vec![sender_task, receiver_task]),
            }),
            events: events_rx,
        })
    }
}

fn parse_relay_frame(text: &str) -> Result<RelayFrame> {
    serde_json::from_str(text).map_err(|e| ProctorError::InvalidSignalingMessage(e.to_string()))
}

async fn read_welcome<S>(ws_receiver: &mut S) -> Result<ConnectionId>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = ws_receiver.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match parse_relay_frame(&text)? {
            RelayFrame::Welcome { connection_id } => return Ok(connection_id),
            RelayFrame::Error { reason } => return Err(ProctorError::SignalingConnect(reason)),
            RelayFrame::Message { .. } => continue,
        }
    }
    Err(ProctorError::SignalingClosed)
}

struct WsLink {
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl SignalingLink for WsLink {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn send(&self, message: SignalingMessage, target: Option<&ConnectionId>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProctorError::SignalingClosed);
        }
        let frame = serde_json::to_string(&ClientFrame::Send {
            target: target.cloned(),
            message,
        })?;
        self.outbound
            .send(Message::Text(frame))
            .map_err(|_| ProctorError::SignalingClosed)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(leave) = serde_json::to_string(&ClientFrame::Leave) {
            let _ = self.outbound.send(Message::Text(leave));
        }
        let _ = self.outbound.send(Message::Close(None));

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        // The writer drains Leave + Close on its own; only the reader is cut short
        if let Some(receiver_task) = tasks.get(1) {
            receiver_task.abort();
        }
        tracing::info!(connection_id = %self.connection_id, "Disconnected from signaling relay");
    }
}
