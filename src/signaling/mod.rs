mod channel;
mod frame;
mod memory;
mod message;
mod room;
mod ws_client;

pub use channel::{
    SignalingChannel, SignalingConnection, SignalingEvent, SignalingLink, TransportEvent,
};
pub use frame::{ClientFrame, RelayFrame};
pub use memory::{MemoryRelay, RelayedMessage, JOURNAL_CAPACITY};
pub use message::{
    AttemptSessionId, ConnectionId, IceCandidatePayload, LinkStatus, PeerRole, SignalingMessage,
    ViolationEvent,
};
pub use room::{JoinOutcome, LeaveOutcome, Occupant, RoomRegistry};
pub use ws_client::WsSignalingChannel;
