//! Live proctoring transport.
//!
//! Keeps a peer-to-peer video link between an exam candidate and a proctor
//! alive through a signaling relay, and records the candidate's camera into
//! short segments that are uploaded independently of the live link.
//!
//! - `signaling`: message contract, relay client, room registry, in-memory relay
//! - `peer`: publisher and viewer sessions, negotiation guards, reconnection
//! - `recording`: segment recorder and ordered upload queue
//! - `capability`: fetch-once video feature flags and relay servers
//! - `media`: caller-owned media sources (GStreamer camera / test pattern)
//! - `api`: development relay server routes

pub mod api;
pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod peer;
pub mod recording;
pub mod signaling;

pub use error::{ProctorError, Result};
