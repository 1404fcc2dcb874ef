//! Proctor-side session: answers the candidate's offers and passes
//! session-control broadcasts through to its owner.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::actor::{ActorHandle, Command};
use super::connection::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventSink, PeerSpec,
    RemoteTrackInfo, TaggedPeerEvent,
};
use super::link::SignalingSlot;
use super::negotiation::{CandidateDisposition, Negotiation, NegotiationRole};
use super::state::ConnectionState;
use super::supervisor::ReconnectSupervisor;
use super::timers::Timers;
use crate::capability::{CapabilityCache, RelayServer};
use crate::config::TimingConfig;
use crate::error::{ProctorError, Result};
use crate::signaling::{
    AttemptSessionId, ConnectionId, IceCandidatePayload, LinkStatus, PeerRole, SignalingChannel,
    SignalingEvent, SignalingMessage, TransportEvent, ViolationEvent,
};

/// Everything the viewer's owner is told about
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerNotification {
    Status(ConnectionState),
    RemoteTrack(RemoteTrackInfo),
    CandidateLeft,
    Violation(ViolationEvent),
    ExamSubmitted {
        attempt_id: AttemptSessionId,
    },
    AttemptExpired {
        attempt_id: AttemptSessionId,
        reason: Option<String>,
    },
}

impl ViewerNotification {
    /// JSON rendering for logs and the CLI
    pub fn to_json(&self) -> Value {
        match self {
            ViewerNotification::Status(state) => serde_json::json!({ "status": state }),
            ViewerNotification::RemoteTrack(track) => serde_json::json!({
                "remoteTrack": { "id": track.track_id, "kind": track.kind, "streamId": track.stream_id }
            }),
            ViewerNotification::CandidateLeft => serde_json::json!({ "candidateLeft": true }),
            ViewerNotification::Violation(event) => serde_json::json!({ "violation": event }),
            ViewerNotification::ExamSubmitted { attempt_id } => {
                serde_json::json!({ "examSubmitted": attempt_id })
            }
            ViewerNotification::AttemptExpired { attempt_id, reason } => {
                serde_json::json!({ "attemptExpired": attempt_id, "reason": reason })
            }
        }
    }
}

pub struct ViewerSession {
    attempt: AttemptSessionId,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerConnectionFactory>,
    capabilities: Arc<CapabilityCache>,
    timing: TimingConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Option<ActorHandle>,
}

impl ViewerSession {
    pub fn new(
        attempt: AttemptSessionId,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerConnectionFactory>,
        capabilities: Arc<CapabilityCache>,
        timing: TimingConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            attempt,
            channel,
            factory,
            capabilities,
            timing,
            state: Arc::new(state),
            running: None,
        }
    }

    pub fn attempt(&self) -> &AttemptSessionId {
        &self.attempt
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Join the room as proctor. No peer connection exists until the
    /// candidate offers.
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ViewerNotification>> {
        if let Some(running) = &self.running {
            if !running.is_finished() {
                return Err(ProctorError::AlreadyStarted);
            }
        }
        if let Some(previous) = self.running.take() {
            previous.shutdown().await;
        }

        let capabilities = self.capabilities.get().await;
        if !capabilities.enable_live_video {
            return Err(ProctorError::FeatureDisabled("live video"));
        }

        let signaling = SignalingSlot::open(
            self.channel.clone(),
            self.attempt.clone(),
            PeerRole::Proctor,
            self.timing.reconnect_policy(),
        )
        .await?;

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let actor = ViewerActor {
            signaling,
            factory: self.factory.clone(),
            relay_servers: capabilities.relay_servers,
            timing: self.timing.clone(),
            state: self.state.clone(),
            notify: notify_tx,
            peer_tx,
            peer_rx,
            generation: 0,
            peer: None,
            peer_state: PeerConnectionState::New,
            negotiation: Negotiation::new(NegotiationRole::Answerer),
            candidate: None,
            peer_retry: ReconnectSupervisor::new(self.timing.reconnect_policy()),
            transport_interrupted: false,
            timers: Timers::new(),
            disposed: false,
        };
        actor.set_state(ConnectionState::Connecting);

        tracing::info!(attempt_id = %self.attempt, "Viewer connected");
        self.running = Some(ActorHandle::spawn(|commands| actor.run(commands)));
        Ok(notify_rx)
    }

    /// Leave the room and release the peer connection. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown().await;
            tracing::info!(attempt_id = %self.attempt, "Viewer disconnected");
        }
        self.state.send_replace(ConnectionState::Idle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewerTimer {
    /// Delay after a candidate join before asking for an offer
    RenegotiationGrace,
    DisconnectGrace,
    /// Re-ask when an earlier request produced no working connection
    RenegotiationWatchdog,
    SignalingReconnect,
}

enum Step {
    Command(Option<Command>),
    Signaling(Option<SignalingEvent>),
    Peer(u64, PeerEvent),
    Timer(ViewerTimer),
}

struct ViewerActor {
    signaling: SignalingSlot,
    factory: Arc<dyn PeerConnectionFactory>,
    relay_servers: Vec<RelayServer>,
    timing: TimingConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    notify: mpsc::UnboundedSender<ViewerNotification>,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_state: PeerConnectionState,
    negotiation: Negotiation,
    candidate: Option<ConnectionId>,
    peer_retry: ReconnectSupervisor,
    /// Set while the signaling transport is down or recovering
    transport_interrupted: bool,
    timers: Timers<ViewerTimer>,
    disposed: bool,
}

impl ViewerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let step = tokio::select! {
                biased;
                command = commands.recv() => Step::Command(command),
                event = self.signaling.recv() => Step::Signaling(event),
                Some((generation, event)) = self.peer_rx.recv() => Step::Peer(generation, event),
                timer = self.timers.expired() => Step::Timer(timer),
            };

            match step {
                Step::Command(command) => {
                    self.release().await;
                    if let Some(Command::Stop(done)) = command {
                        let _ = done.send(());
                    }
                }
                Step::Signaling(Some(event)) => self.on_signaling(event).await,
                Step::Signaling(None) => self.on_transport_lost().await,
                Step::Peer(generation, event) if generation == self.generation => {
                    self.on_peer_event(event).await
                }
                Step::Peer(generation, _) => {
                    tracing::trace!(generation, current = self.generation, "Dropped event from replaced peer connection");
                }
                Step::Timer(timer) => self.on_timer(timer).await,
            }

            if self.disposed {
                break;
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let attempt = self.signaling.attempt();
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(attempt_id = %attempt, from = %current, to = %next, "Viewer state changed");
            *current = next;
            true
        });
        if changed {
            self.emit(ViewerNotification::Status(next));
        }
    }

    fn emit(&self, notification: ViewerNotification) {
        let _ = self.notify.send(notification);
    }

    async fn release(&mut self) {
        self.disposed = true;
        self.timers.clear();
        self.close_peer().await;
        self.signaling.disconnect().await;
    }

    async fn go_offline(&mut self, reason: &str) {
        tracing::warn!(attempt_id = %self.signaling.attempt(), reason, "Viewer offline");
        self.release().await;
        self.set_state(ConnectionState::Offline);
    }

    async fn close_peer(&mut self) {
        self.generation += 1;
        self.peer_state = PeerConnectionState::New;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }

    async fn build_peer(&mut self) -> Result<Arc<dyn PeerConnection>> {
        self.close_peer().await;
        let spec = PeerSpec {
            relay_servers: self.relay_servers.clone(),
            media: None,
            events: PeerEventSink::new(self.generation, self.peer_tx.clone()),
        };
        let peer = self.factory.create(spec).await?;
        self.peer = Some(peer.clone());
        tracing::debug!(generation = self.generation, "Created viewer peer connection");
        Ok(peer)
    }

    /// Ask the publisher for a fresh offer, bounded by the retry budget
    async fn request_renegotiation(&mut self) {
        let Some(retry_after) = self.peer_retry.next_delay() else {
            self.go_offline("renegotiation budget exhausted").await;
            return;
        };
        tracing::info!(
            attempt = self.peer_retry.attempts(),
            target = ?self.candidate.as_ref().map(|id| id.as_str()),
            "Requesting renegotiation"
        );
        let request = SignalingMessage::RenegotiationRequested {
            from_connection_id: self.signaling.connection_id(),
        };
        self.signaling.send(request, self.candidate.as_ref()).await;
        self.timers
            .schedule(ViewerTimer::RenegotiationWatchdog, retry_after);
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Transport(TransportEvent::Disconnected) => self.on_transport_lost().await,
            SignalingEvent::Transport(TransportEvent::Reconnecting) => {
                self.transport_interrupted = true;
                self.set_state(ConnectionState::Reconnecting);
            }
            SignalingEvent::Transport(TransportEvent::Connected) => {
                if self.transport_interrupted {
                    self.on_transport_restored().await;
                }
            }
            SignalingEvent::Message(message) => self.on_message(message).await,
        }
    }

    async fn on_transport_lost(&mut self) {
        tracing::warn!(attempt_id = %self.signaling.attempt(), "Signaling transport lost");
        self.transport_interrupted = true;
        self.signaling.disconnect().await;
        self.set_state(ConnectionState::Reconnecting);
        self.schedule_signaling_reconnect().await;
    }

    async fn schedule_signaling_reconnect(&mut self) {
        match self.signaling.supervisor.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.signaling.supervisor.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling signaling reconnect"
                );
                self.timers.schedule(ViewerTimer::SignalingReconnect, delay);
            }
            None => self.go_offline("signaling reconnection budget exhausted").await,
        }
    }

    /// Any handshake in flight on the other side may be stale now
    async fn on_transport_restored(&mut self) {
        self.transport_interrupted = false;
        self.signaling.supervisor.reset();
        if self.peer_state != PeerConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
        } else {
            self.set_state(ConnectionState::Live);
        }
        self.request_renegotiation().await;
    }

    async fn on_timer(&mut self, timer: ViewerTimer) {
        match timer {
            ViewerTimer::SignalingReconnect => match self.signaling.connect().await {
                Ok(()) => {
                    // The new connection reports Connected as its first event
                    tracing::info!("Signaling reconnected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Signaling reconnect failed");
                    self.schedule_signaling_reconnect().await;
                }
            },
            ViewerTimer::RenegotiationGrace => {
                if self.peer.is_none() && self.candidate.is_some() {
                    self.request_renegotiation().await;
                }
            }
            ViewerTimer::DisconnectGrace => {
                if self.peer_state == PeerConnectionState::Disconnected {
                    self.request_renegotiation().await;
                }
            }
            ViewerTimer::RenegotiationWatchdog => match (self.peer.is_some(), self.peer_state) {
                (_, PeerConnectionState::Connected) => {}
                // An answered connection still establishing gets more time
                (true, PeerConnectionState::New | PeerConnectionState::Connecting) => {
                    let wait = self.timing.disconnect_grace;
                    self.timers.schedule(ViewerTimer::RenegotiationWatchdog, wait);
                }
                _ => {
                    if self.candidate.is_some() || self.peer.is_some() {
                        self.request_renegotiation().await;
                    }
                }
            },
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::RoomJoined {
                role: PeerRole::Candidate,
                connection_id,
            } => {
                tracing::info!(candidate = %connection_id, "Candidate joined");
                self.candidate = Some(connection_id);
                self.timers
                    .schedule(ViewerTimer::RenegotiationGrace, self.timing.renegotiation_grace);
            }
            SignalingMessage::RoomLeft { connection_id } => {
                if self.candidate.as_ref() != Some(&connection_id) {
                    return;
                }
                tracing::info!(candidate = %connection_id, "Candidate left");
                self.candidate = None;
                self.timers.cancel(ViewerTimer::RenegotiationGrace);
                self.timers.cancel(ViewerTimer::RenegotiationWatchdog);
                self.timers.cancel(ViewerTimer::DisconnectGrace);
                self.close_peer().await;
                self.negotiation.reset();
                self.peer_retry.reset();
                self.emit(ViewerNotification::CandidateLeft);
                self.set_state(ConnectionState::Connecting);
            }
            SignalingMessage::Offer {
                sdp,
                from_connection_id,
                negotiation_id,
                ice_restart,
            } => {
                self.on_offer(sdp, from_connection_id, negotiation_id, ice_restart)
                    .await
            }
            SignalingMessage::IceCandidate {
                payload,
                from_connection_id,
                negotiation_id,
                ..
            } => {
                self.on_remote_candidate(payload, from_connection_id, negotiation_id)
                    .await
            }
            SignalingMessage::ViolationEvent(event) => {
                tracing::info!(event_type = %event.event_type, severity = %event.severity, "Violation reported");
                self.emit(ViewerNotification::Violation(event));
            }
            SignalingMessage::ExamSubmitted { attempt_id } => {
                tracing::info!(attempt_id = %attempt_id, "Exam submitted");
                self.emit(ViewerNotification::ExamSubmitted { attempt_id });
            }
            SignalingMessage::AttemptExpired { attempt_id, reason } => {
                tracing::info!(attempt_id = %attempt_id, reason = ?reason, "Attempt expired");
                self.emit(ViewerNotification::AttemptExpired { attempt_id, reason });
            }
            SignalingMessage::ConnectionStatus { status } => {
                tracing::debug!(status = ?status, "Candidate reported link status");
            }
            other => {
                tracing::trace!(kind = other.kind(), "Ignoring message");
            }
        }
    }

    async fn on_offer(
        &mut self,
        sdp: String,
        from: ConnectionId,
        negotiation_id: Option<u64>,
        ice_restart: bool,
    ) {
        self.timers.cancel(ViewerTimer::RenegotiationGrace);
        self.timers.cancel(ViewerTimer::RenegotiationWatchdog);

        let in_place = ice_restart && self.candidate.as_ref() == Some(&from);
        let reusable = if in_place { self.peer.clone() } else { None };
        let peer = match reusable {
            Some(peer) => peer,
            None => match self.build_peer().await {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create peer connection for offer");
                    self.request_renegotiation().await;
                    return;
                }
            },
        };
        self.candidate = Some(from.clone());

        tracing::info!(from = %from, negotiation_id = ?negotiation_id, ice_restart, "Received offer");
        self.negotiation.begin_answer(from.clone(), negotiation_id);

        if let Err(e) = peer.set_remote_offer(&sdp).await {
            tracing::warn!(error = %e, "Failed to apply offer");
            self.close_peer().await;
            self.request_renegotiation().await;
            return;
        }
        for candidate in self.negotiation.mark_remote_description() {
            add_remote_candidate(peer.as_ref(), candidate).await;
        }

        let sdp = match peer.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create answer");
                self.close_peer().await;
                self.request_renegotiation().await;
                return;
            }
        };

        let Some(own_id) = self.signaling.connection_id() else {
            return;
        };
        let answer = SignalingMessage::Answer {
            sdp,
            from_connection_id: own_id,
            negotiation_id,
        };
        self.signaling.send(answer, Some(&from)).await;
        if self.peer_state != PeerConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
        }
    }

    async fn on_remote_candidate(
        &mut self,
        payload: IceCandidatePayload,
        from: Option<ConnectionId>,
        negotiation_id: Option<u64>,
    ) {
        match self.negotiation.accept_candidate(payload, from, negotiation_id) {
            CandidateDisposition::Apply(candidate) => {
                if let Some(peer) = self.peer.clone() {
                    add_remote_candidate(peer.as_ref(), candidate).await;
                }
            }
            CandidateDisposition::Queued => {
                tracing::debug!("Queued remote ICE candidate until the offer is applied");
            }
            CandidateDisposition::Stale => {
                tracing::debug!(negotiation_id = ?negotiation_id, "Discarded ICE candidate from a superseded handshake");
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(payload) => {
                let message = SignalingMessage::IceCandidate {
                    payload,
                    from_connection_id: self.signaling.connection_id(),
                    target_connection_id: self.candidate.clone(),
                    negotiation_id: self.negotiation.current_id(),
                };
                self.signaling.send(message, self.candidate.as_ref()).await;
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::info!(track_id = %track.track_id, kind = %track.kind, "Remote track received");
                self.emit(ViewerNotification::RemoteTrack(track));
            }
            PeerEvent::StateChanged(state) => self.on_peer_state(state).await,
        }
    }

    async fn on_peer_state(&mut self, state: PeerConnectionState) {
        tracing::debug!(generation = self.generation, state = ?state, "Viewer peer state");
        self.peer_state = state;
        match state {
            PeerConnectionState::Connected => {
                self.timers.cancel(ViewerTimer::DisconnectGrace);
                self.timers.cancel(ViewerTimer::RenegotiationWatchdog);
                self.peer_retry.reset();
                self.set_state(ConnectionState::Live);
                if self.candidate.is_some() {
                    self.signaling
                        .send(
                            SignalingMessage::ConnectionStatus {
                                status: LinkStatus::Connected,
                            },
                            self.candidate.as_ref(),
                        )
                        .await;
                }
            }
            PeerConnectionState::Disconnected => {
                self.set_state(ConnectionState::Reconnecting);
                self.timers
                    .schedule(ViewerTimer::DisconnectGrace, self.timing.disconnect_grace);
            }
            PeerConnectionState::Failed => {
                self.set_state(ConnectionState::Reconnecting);
                self.timers.cancel(ViewerTimer::DisconnectGrace);
                self.request_renegotiation().await;
            }
            PeerConnectionState::Closed => self.go_offline("peer connection closed").await,
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }
}

async fn add_remote_candidate(peer: &dyn PeerConnection, candidate: IceCandidatePayload) {
    if let Err(e) = peer.add_ice_candidate(candidate).await {
        tracing::debug!(error = %e, "Failed to add remote ICE candidate");
    }
}
