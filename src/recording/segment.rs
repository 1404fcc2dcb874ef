use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// One fixed-duration slice of recorded media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Monotonic within one recording run, starting at 0
    pub index: u64,
    pub payload: Bytes,
    pub captured_at_ms: u64,
    /// Failed upload attempts so far
    pub retry_count: u32,
}

impl Segment {
    pub fn new(index: u64, payload: Bytes, captured_at_ms: u64) -> Self {
        Self {
            index,
            payload,
            captured_at_ms,
            retry_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Index allocator for one recording run. Indices are never reused.
#[derive(Debug, Default)]
pub struct SegmentSequence {
    next: u64,
}

impl SegmentSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&mut self) -> u64 {
        let index = self.next;
        self.next += 1;
        index
    }

    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// Outcome notices streamed to the recorder's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    Uploaded { index: u64, attempts: u32 },
    /// Retry budget exhausted; reported once per segment
    Dropped { index: u64, attempts: u32 },
    /// Still queued when the drain timeout expired
    Abandoned { index: u64 },
    /// Capture stopped producing data
    Fatal(String),
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
