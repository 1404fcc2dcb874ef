//! Segment recording and upload.
//!
//! The recorder slices the caller's capture into fixed-duration segments
//! and hands them to a single upload worker. Segments upload strictly in
//! index order, each with its own bounded retry budget.

mod recorder;
mod segment;
mod state;
mod uploader;

pub use recorder::{RecorderStats, SegmentRecorder};
pub use segment::{RecorderEvent, Segment, SegmentSequence};
pub use state::RecordingState;
pub use uploader::{HttpSegmentUploader, SegmentUploader};
