use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::capability::RelayServer;
use crate::error::Result;
use crate::media::MediaSource;
use crate::signaling::IceCandidatePayload;

/// Transport health reported by the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub kind: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged(PeerConnectionState),
    LocalCandidate(IceCandidatePayload),
    RemoteTrack(RemoteTrackInfo),
}

/// Peer events tagged with the generation of the connection that raised them
pub type TaggedPeerEvent = (u64, PeerEvent);

/// Callback target handed to a new peer connection. Events from a connection
/// that has since been replaced carry an old generation and are ignored.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedPeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

pub struct PeerSpec {
    pub relay_servers: Vec<RelayServer>,
    /// Publisher only; the viewer receives
    pub media: Option<Arc<dyn MediaSource>>,
    pub events: PeerEventSink,
}

/// One underlying peer connection. Offer/answer creation also applies the
/// result as the local description.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, spec: PeerSpec) -> Result<Arc<dyn PeerConnection>>;
}
