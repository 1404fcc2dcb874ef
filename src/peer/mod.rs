//! Peer sessions for both sides of an attempt.
//!
//! Each session is a single task reacting to signaling messages, peer
//! connection callbacks and its own timers. Owners talk to it through the
//! session handle and observe it through a `watch` of [`ConnectionState`].

mod actor;
mod connection;
mod link;
mod negotiation;
mod publisher;
mod state;
mod supervisor;
mod timers;
mod viewer;
mod webrtc_backend;

pub use connection::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventSink, PeerSpec,
    RemoteTrackInfo, SignalingState, TaggedPeerEvent,
};
pub use negotiation::{CandidateDisposition, Negotiation, NegotiationRole};
pub use publisher::PublisherSession;
pub use state::ConnectionState;
pub use supervisor::{exponential_delay, ReconnectPolicy, ReconnectSupervisor};
pub use timers::Timers;
pub use viewer::{ViewerNotification, ViewerSession};
pub use webrtc_backend::{create_webrtc_api, WebRtcPeerConnection, WebRtcPeerFactory};
