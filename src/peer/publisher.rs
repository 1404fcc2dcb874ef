//! Candidate-side session: one outbound offer kept valid for the joined proctor.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::actor::{ActorHandle, Command};
use super::connection::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventSink, PeerSpec,
    SignalingState, TaggedPeerEvent,
};
use super::link::SignalingSlot;
use super::negotiation::{CandidateDisposition, Negotiation, NegotiationRole};
use super::state::ConnectionState;
use super::supervisor::ReconnectSupervisor;
use super::timers::Timers;
use crate::capability::{CapabilityCache, RelayServer};
use crate::config::TimingConfig;
use crate::error::{ProctorError, Result};
use crate::media::MediaSource;
use crate::signaling::{
    AttemptSessionId, ConnectionId, IceCandidatePayload, LinkStatus, PeerRole, SignalingChannel,
    SignalingEvent, SignalingMessage, TransportEvent,
};

pub struct PublisherSession {
    attempt: AttemptSessionId,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerConnectionFactory>,
    capabilities: Arc<CapabilityCache>,
    timing: TimingConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Option<ActorHandle>,
}

impl PublisherSession {
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

    /// Join the attempt's room and publish `media` to whichever proctor joins.
    ///
    /// The session stays `Connecting` until the peer transport reports
    /// connected. `media` is never stopped by the session.
    pub async fn start(&mut self, media: Arc<dyn MediaSource>) -> Result<()> {
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

        self.state.send_replace(ConnectionState::Connecting);

        let signaling = match SignalingSlot::open(
            self.channel.clone(),
            self.attempt.clone(),
            PeerRole::Candidate,
            self.timing.reconnect_policy(),
        )
        .await
        {
            Ok(signaling) => signaling,
            Err(e) => {
                self.state.send_replace(ConnectionState::Idle);
                return Err(e);
            }
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut actor = PublisherActor {
            signaling,
            factory: self.factory.clone(),
            media: media.clone(),
            relay_servers: capabilities.relay_servers,
            timing: self.timing.clone(),
            state: self.state.clone(),
            peer_tx,
            peer_rx,
            generation: 0,
            peer: None,
            peer_state: PeerConnectionState::New,
            negotiated: false,
            ice_restart_attempted: false,
            negotiation: Negotiation::new(NegotiationRole::Offerer),
            proctor: None,
            peer_retry: ReconnectSupervisor::new(self.timing.reconnect_policy()),
            timers: Timers::new(),
            disposed: false,
        };

        if let Err(e) = actor.build_peer().await {
            actor.release().await;
            self.state.send_replace(ConnectionState::Idle);
            return Err(e);
        }

        tracing::info!(
            attempt_id = %self.attempt,
            media_source = media.id(),
            "Publisher started"
        );
        self.running = Some(ActorHandle::spawn(|commands| actor.run(commands)));
        Ok(())
    }

    /// Release the peer connection and the signaling handle. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown().await;
            tracing::info!(attempt_id = %self.attempt, "Publisher stopped");
        }
        self.state.send_replace(ConnectionState::Idle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherTimer {
    DisconnectGrace,
    SignalingReconnect,
}

enum Step {
    Command(Option<Command>),
    Signaling(Option<SignalingEvent>),
    Peer(u64, PeerEvent),
    Timer(PublisherTimer),
}

struct PublisherActor {
    signaling: SignalingSlot,
    factory: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaSource>,
    relay_servers: Vec<RelayServer>,
    timing: TimingConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    /// Bumped whenever the peer connection is replaced
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_state: PeerConnectionState,
    /// True once the current connection has produced an offer
    negotiated: bool,
    ice_restart_attempted: bool,
    negotiation: Negotiation,
    proctor: Option<ConnectionId>,
    peer_retry: ReconnectSupervisor,
    timers: Timers<PublisherTimer>,
    disposed: bool,
}

impl PublisherActor {
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
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(attempt_id = %attempt, from = %current, to = %next, "Publisher state changed");
            *current = next;
            true
        });
    }

    /// State implied by the peer transport once signaling is healthy
    fn refresh_state(&self) {
        let next = match self.peer_state {
            PeerConnectionState::Connected => ConnectionState::Live,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                ConnectionState::Reconnecting
            }
            _ => ConnectionState::Connecting,
        };
        self.set_state(next);
    }

    /// Close resources and short-circuit everything still pending
    async fn release(&mut self) {
        self.disposed = true;
        self.timers.clear();
        self.close_peer().await;
        self.signaling.disconnect().await;
    }

    async fn fail(&mut self, reason: &str) {
        tracing::error!(attempt_id = %self.signaling.attempt(), reason, "Publisher failed");
        self.release().await;
        self.set_state(ConnectionState::Failed);
    }

    async fn close_peer(&mut self) {
        self.generation += 1;
        self.peer_state = PeerConnectionState::New;
        self.negotiated = false;
        self.ice_restart_attempted = false;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }

    /// Replace the peer connection; the old one is closed first
    async fn build_peer(&mut self) -> Result<()> {
        self.close_peer().await;
        self.negotiation.reset();

        let spec = PeerSpec {
            relay_servers: self.relay_servers.clone(),
            media: Some(self.media.clone()),
            events: PeerEventSink::new(self.generation, self.peer_tx.clone()),
        };
        self.peer = Some(self.factory.create(spec).await?);
        tracing::debug!(generation = self.generation, "Created publisher peer connection");
        Ok(())
    }

    fn consume_peer_retry(&mut self) -> bool {
        match self.peer_retry.next_delay() {
            Some(_) => {
                tracing::info!(
                    attempt = self.peer_retry.attempts(),
                    max_attempts = self.peer_retry.policy().max_attempts,
                    "Recovering publisher peer connection"
                );
                true
            }
            None => false,
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let Some(own_id) = self.signaling.connection_id() else {
            tracing::debug!("Signaling down, offer deferred until rejoin");
            return;
        };

        let negotiation_id = self.negotiation.begin_offer(self.proctor.clone());
        match peer.create_offer(ice_restart).await {
            Ok(sdp) => {
                self.negotiated = true;
                tracing::info!(
                    negotiation_id,
                    ice_restart,
                    target = ?self.proctor.as_ref().map(|id| id.as_str()),
                    "Sending offer"
                );
                let offer = SignalingMessage::Offer {
                    sdp,
                    from_connection_id: own_id,
                    negotiation_id: Some(negotiation_id),
                    ice_restart,
                };
                self.signaling.send(offer, self.proctor.as_ref()).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, negotiation_id, "Failed to create offer");
                self.negotiation.reset();
            }
        }
    }

    /// Offer on a connection that has never negotiated, rebuilding if needed
    async fn fresh_offer(&mut self) {
        if self.peer.is_none() || self.negotiated {
            if let Err(e) = self.build_peer().await {
                tracing::error!(error = %e, "Failed to rebuild peer connection");
                self.fail("peer connection could not be rebuilt").await;
                return;
            }
            if *self.state.borrow() == ConnectionState::Live {
                self.set_state(ConnectionState::Connecting);
            }
        }
        self.send_offer(false).await;
    }

    async fn recover_by_rebuild(&mut self) {
        if !self.consume_peer_retry() {
            self.fail("peer connection retry budget exhausted").await;
            return;
        }
        if let Err(e) = self.build_peer().await {
            tracing::error!(error = %e, "Failed to rebuild peer connection");
            self.fail("peer connection could not be rebuilt").await;
            return;
        }
        if self.proctor.is_some() {
            self.send_offer(false).await;
        }
    }

    async fn send_status(&self, status: LinkStatus) {
        if self.proctor.is_some() {
            self.signaling
                .send(SignalingMessage::ConnectionStatus { status }, self.proctor.as_ref())
                .await;
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Transport(TransportEvent::Disconnected) => self.on_transport_lost().await,
            SignalingEvent::Transport(TransportEvent::Reconnecting) => {
                self.set_state(ConnectionState::Reconnecting);
            }
            SignalingEvent::Transport(TransportEvent::Connected) => self.refresh_state(),
            SignalingEvent::Message(message) => self.on_message(message).await,
        }
    }

    async fn on_transport_lost(&mut self) {
        tracing::warn!(attempt_id = %self.signaling.attempt(), "Signaling transport lost");
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
                self.timers.schedule(PublisherTimer::SignalingReconnect, delay);
            }
            None => self.fail("signaling reconnection budget exhausted").await,
        }
    }

    async fn on_timer(&mut self, timer: PublisherTimer) {
        match timer {
            PublisherTimer::SignalingReconnect => match self.signaling.connect().await {
                Ok(()) => {
                    self.signaling.supervisor.reset();
                    self.refresh_state();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Signaling reconnect failed");
                    self.schedule_signaling_reconnect().await;
                }
            },
            PublisherTimer::DisconnectGrace => {
                if self.peer_state != PeerConnectionState::Disconnected {
                    return;
                }
                if !self.ice_restart_attempted && self.proctor.is_some() && self.peer.is_some() {
                    if !self.consume_peer_retry() {
                        self.fail("peer connection retry budget exhausted").await;
                        return;
                    }
                    self.ice_restart_attempted = true;
                    self.send_offer(true).await;
                    self.timers
                        .schedule(PublisherTimer::DisconnectGrace, self.timing.disconnect_grace);
                } else {
                    self.recover_by_rebuild().await;
                }
            }
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::RoomJoined {
                role: PeerRole::Proctor,
                connection_id,
            } => {
                tracing::info!(proctor = %connection_id, "Proctor joined");
                self.proctor = Some(connection_id);
                self.fresh_offer().await;
            }
            SignalingMessage::RoomLeft { connection_id } => {
                if self.proctor.as_ref() != Some(&connection_id) {
                    return;
                }
                tracing::info!(proctor = %connection_id, "Proctor left");
                self.proctor = None;
                self.timers.cancel(PublisherTimer::DisconnectGrace);
                self.peer_retry.reset();
                if let Err(e) = self.build_peer().await {
                    tracing::error!(error = %e, "Failed to rebuild peer connection");
                    self.fail("peer connection could not be rebuilt").await;
                    return;
                }
                self.set_state(ConnectionState::Connecting);
            }
            SignalingMessage::RenegotiationRequested { from_connection_id } => {
                tracing::info!(from = ?from_connection_id.as_ref().map(|id| id.as_str()), "Renegotiation requested");
                if let Some(from) = from_connection_id {
                    self.proctor = Some(from);
                }
                self.fresh_offer().await;
            }
            SignalingMessage::Answer {
                sdp,
                from_connection_id,
                negotiation_id,
            } => self.on_answer(sdp, from_connection_id, negotiation_id).await,
            SignalingMessage::IceCandidate {
                payload,
                from_connection_id,
                negotiation_id,
                ..
            } => {
                self.on_remote_candidate(payload, from_connection_id, negotiation_id)
                    .await
            }
            SignalingMessage::ConnectionStatus { status } => {
                tracing::debug!(status = ?status, "Proctor reported link status");
            }
            other => {
                tracing::trace!(kind = other.kind(), "Ignoring message");
            }
        }
    }

    async fn on_answer(&mut self, sdp: String, from: ConnectionId, negotiation_id: Option<u64>) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let signaling_state = peer.signaling_state();
        if signaling_state != SignalingState::HaveLocalOffer {
            tracing::debug!(from = %from, signaling_state = ?signaling_state, "Ignoring answer, no local offer pending");
            return;
        }
        if let Err(e) = self.negotiation.accept_answer(&from, negotiation_id) {
            tracing::debug!(error = %e, from = %from, "Ignoring answer");
            return;
        }
        if let Err(e) = peer.set_remote_answer(&sdp).await {
            tracing::warn!(error = %e, "Failed to apply answer");
            return;
        }
        tracing::info!(from = %from, negotiation_id = ?negotiation_id, "Applied answer");
        if self.proctor.is_none() {
            self.proctor = Some(from);
        }
        for candidate in self.negotiation.mark_remote_description() {
            add_remote_candidate(peer.as_ref(), candidate).await;
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
                tracing::debug!("Queued remote ICE candidate until the answer is applied");
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
                    target_connection_id: self.proctor.clone(),
                    negotiation_id: self.negotiation.current_id(),
                };
                self.signaling.send(message, self.proctor.as_ref()).await;
            }
            PeerEvent::StateChanged(state) => self.on_peer_state(state).await,
            PeerEvent::RemoteTrack(_) => {}
        }
    }

    async fn on_peer_state(&mut self, state: PeerConnectionState) {
        tracing::debug!(generation = self.generation, state = ?state, "Publisher peer state");
        self.peer_state = state;
        match state {
            PeerConnectionState::Connected => {
                self.timers.cancel(PublisherTimer::DisconnectGrace);
                self.peer_retry.reset();
                self.ice_restart_attempted = false;
                self.set_state(ConnectionState::Live);
                self.send_status(LinkStatus::Connected).await;
            }
            PeerConnectionState::Disconnected => {
                self.set_state(ConnectionState::Reconnecting);
                self.send_status(LinkStatus::Reconnecting).await;
                self.timers
                    .schedule(PublisherTimer::DisconnectGrace, self.timing.disconnect_grace);
            }
            PeerConnectionState::Failed => {
                self.set_state(ConnectionState::Reconnecting);
                self.timers.cancel(PublisherTimer::DisconnectGrace);
                self.recover_by_rebuild().await;
            }
            PeerConnectionState::Closed => self.fail("peer connection closed").await,
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }
}

async fn add_remote_candidate(peer: &dyn PeerConnection, candidate: IceCandidatePayload) {
    if let Err(e) = peer.add_ice_candidate(candidate).await {
        tracing::debug!(error = %e, "Failed to add remote ICE candidate");
    }
}
