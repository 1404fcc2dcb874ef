// Shared fakes for session scenarios
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use proctor_link::capability::{CapabilityCache, VideoCapabilityConfig};
use proctor_link::config::TimingConfig;
use proctor_link::media::{LocalTrack, MediaSource};
use proctor_link::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventSink, PeerSpec, SignalingState,
};
use proctor_link::signaling::{AttemptSessionId, ConnectionId, IceCandidatePayload, MemoryRelay, PeerRole};
use proctor_link::{ProctorError, Result};

pub fn attempt() -> AttemptSessionId {
    AttemptSessionId::new("attempt-42")
}

pub fn live_video() -> Arc<CapabilityCache> {
    Arc::new(CapabilityCache::with_config(VideoCapabilityConfig {
        enable_live_video: true,
        enable_video_recording: true,
        ..VideoCapabilityConfig::disabled()
    }))
}

pub fn video_disabled() -> Arc<CapabilityCache> {
    Arc::new(CapabilityCache::with_config(VideoCapabilityConfig::disabled()))
}

pub fn timing() -> TimingConfig {
    TimingConfig::default()
}

/// Camera stand-in with no real tracks
pub struct StillCamera;

impl MediaSource for StillCamera {
    fn id(&self) -> &str {
        "still-camera"
    }

    fn tracks(&self) -> Vec<LocalTrack> {
        Vec::new()
    }
}

pub fn camera() -> Arc<dyn MediaSource> {
    Arc::new(StillCamera)
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    offers: u32,
    ice_restarts: u32,
    answers: u32,
    remote_offers: u32,
    remote_answers: u32,
    answer_calls: u32,
    remote_candidates: Vec<IceCandidatePayload>,
    closed: bool,
}

/// Peer connection whose transport "connects" as soon as a handshake
/// completes. Transport states can be injected afterwards.
pub struct FakePeer {
    pub id: usize,
    pub has_media: bool,
    events: PeerEventSink,
    state: Mutex<FakeState>,
}

impl FakePeer {
    fn local_candidate(&self) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", self.id, self.id, self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn handshake_complete(&self) {
        self.events.emit(PeerEvent::LocalCandidate(self.local_candidate()));
        self.events
            .emit(PeerEvent::StateChanged(PeerConnectionState::Connecting));
        self.events
            .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
    }

    /// Simulate the transport changing state on its own
    pub fn inject(&self, state: PeerConnectionState) {
        self.events.emit(PeerEvent::StateChanged(state));
    }

    /// Override the signaling state, as a renegotiation racing the session would
    pub fn force_signaling(&self, signaling: SignalingState) {
        self.state.lock().unwrap().signaling = signaling;
    }

    /// `set_remote_answer` calls, successful or not
    pub fn answer_calls(&self) -> u32 {
        self.state.lock().unwrap().answer_calls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn offers(&self) -> u32 {
        self.state.lock().unwrap().offers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().unwrap().ice_restarts
    }

    pub fn remote_answers(&self) -> u32 {
        self.state.lock().unwrap().remote_answers
    }

    pub fn remote_offers(&self) -> u32 {
        self.state.lock().unwrap().remote_offers
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidatePayload> {
        self.state.lock().unwrap().remote_candidates.clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ProctorError::CreateOfferFailed("connection closed".into()));
        }
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        state.signaling = SignalingState::HaveLocalOffer;
        Ok(format!("offer-{}-{}", self.id, state.offers))
    }

    async fn create_answer(&self) -> Result<String> {
        {
            let mut state = self.state.lock().unwrap();
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(ProctorError::CreateAnswerFailed(format!(
                    "signaling state {:?}",
                    state.signaling
                )));
            }
            state.answers += 1;
            state.signaling = SignalingState::Stable;
        }
        self.handshake_complete();
        Ok(format!("answer-{}", self.id))
    }

    async fn set_remote_offer(&self, _sdp: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.signaling == SignalingState::HaveLocalOffer {
            return Err(ProctorError::SetRemoteDescriptionFailed(format!(
                "signaling state {:?}",
                state.signaling
            )));
        }
        state.remote_offers += 1;
        state.signaling = SignalingState::HaveRemoteOffer;
        Ok(())
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.answer_calls += 1;
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(ProctorError::SetRemoteDescriptionFailed(format!(
                    "answer in signaling state {:?}",
                    state.signaling
                )));
            }
            state.remote_answers += 1;
            state.signaling = SignalingState::Stable;
        }
        self.handshake_complete();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ProctorError::AddIceCandidateFailed("connection closed".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
        }
        self.inject(PeerConnectionState::Closed);
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<Arc<FakePeer>>,
    failing_creates: u32,
}

#[derive(Clone, Default)]
pub struct FakePeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.state.lock().unwrap().failing_creates = count;
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Connections not closed yet
    pub fn open_peers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .filter(|peer| !peer.is_closed())
            .count()
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        self.state
            .lock()
            .unwrap()
            .peers
            .last()
            .cloned()
            .expect("a peer connection was created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, spec: PeerSpec) -> Result<Arc<dyn PeerConnection>> {
        let mut state = self.state.lock().unwrap();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(ProctorError::PeerConnectionCreation("injected failure".into()));
        }
        let peer = Arc::new(FakePeer {
            id: state.peers.len() + 1,
            has_media: spec.media.is_some(),
            events: spec.events,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                offers: 0,
                ice_restarts: 0,
                answers: 0,
                remote_offers: 0,
                remote_answers: 0,
                answer_calls: 0,
                remote_candidates: Vec::new(),
                closed: false,
            }),
        });
        state.peers.push(peer.clone());
        Ok(peer)
    }
}

pub fn occupant(relay: &MemoryRelay, role: PeerRole) -> ConnectionId {
    relay
        .occupants(&attempt())
        .into_iter()
        .find(|(r, _)| *r == role)
        .map(|(_, id)| id)
        .expect("occupant present")
}

/// Let every session task process what is queued, without reaching any
/// session timer
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn wait_for_state(status: &mut watch::Receiver<ConnectionState>, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(300), status.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("state never became {}", expected))
        .expect("session state channel open");
}

/// Poll `condition` in virtual time until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..6000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held: {}", what);
}
