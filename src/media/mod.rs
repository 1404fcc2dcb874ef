//! Caller-owned media sources.
//!
//! A source may be shared by the publisher (live tracks) and the recorder
//! (segment capture). Neither component stops it; the caller owns its
//! lifecycle.

#[cfg(feature = "gstreamer")]
mod gst_source;

use bytes::Bytes;
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;

#[cfg(feature = "gstreamer")]
pub use gst_source::{GstMediaSource, GstSourceKind};

/// Recording encodings in preference order
pub const RECORDING_ENCODINGS: [&str; 3] = [
    "video/webm;codecs=vp9",
    "video/webm;codecs=vp8",
    "video/webm",
];

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Live tracks attached to the publisher's peer connection
pub trait MediaSource: Send + Sync {
    fn id(&self) -> &str;

    fn tracks(&self) -> Vec<LocalTrack>;
}

/// Encoded capture for the segment recorder
pub trait MediaCapture: Send + Sync {
    fn supports(&self, encoding: &str) -> bool;

    fn begin(&self, encoding: &str) -> Result<Box<dyn CaptureStream>>;
}

pub trait CaptureStream: Send {
    /// Encoded data captured since the previous call
    fn take(&mut self) -> Result<Bytes>;

    /// Stop capturing and return whatever is still buffered
    fn finish(&mut self) -> Result<Bytes>;
}

/// First entry of `preferences` the capture supports
pub fn select_encoding<'a>(capture: &dyn MediaCapture, preferences: &'a [String]) -> Option<&'a str> {
    preferences
        .iter()
        .map(String::as_str)
        .find(|encoding| capture.supports(encoding))
}
