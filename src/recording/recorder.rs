use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::segment::{unix_millis, RecorderEvent, Segment, SegmentSequence};
use super::state::RecordingState;
use super::uploader::{SegmentUploader, UploadQueue, UploadWorker};
use crate::config::RecordingConfig;
use crate::error::{ProctorError, Result};
use crate::media::{select_encoding, CaptureStream, MediaCapture, RECORDING_ENCODINGS};
use crate::signaling::AttemptSessionId;

#[derive(Debug, Default)]
pub(crate) struct RecorderCounters {
    pub produced: AtomicU64,
    pub uploaded: AtomicU64,
    pub failed: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Diagnostic counters for one recording run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderStats {
    pub segments_produced: u64,
    pub segments_uploaded: u64,
    pub segments_failed: u64,
    pub segments_abandoned: u64,
    pub elapsed: Duration,
}

struct ActiveRecording {
    encoding: String,
    started_at: Instant,
    stop_tx: oneshot::Sender<()>,
    capture_task: JoinHandle<()>,
    worker: JoinHandle<()>,
    queue: Arc<UploadQueue>,
    events: mpsc::UnboundedSender<RecorderEvent>,
}

/// Time-sliced capture into segments, each uploaded through a
/// head-of-line retry queue. Runs independently of any peer session.
pub struct SegmentRecorder {
    attempt: AttemptSessionId,
    uploader: Arc<dyn SegmentUploader>,
    config: RecordingConfig,
    preferences: Vec<String>,
    state: Arc<RwLock<RecordingState>>,
    counters: Arc<RecorderCounters>,
    active: Option<ActiveRecording>,
    last_elapsed: Duration,
}

impl SegmentRecorder {
    pub fn new(attempt: AttemptSessionId, uploader: Arc<dyn SegmentUploader>, config: RecordingConfig) -> Self {
        Self {
            attempt,
            uploader,
            config,
            preferences: RECORDING_ENCODINGS.iter().map(|e| e.to_string()).collect(),
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            counters: Arc::new(RecorderCounters::default()),
            active: None,
            last_elapsed: Duration::ZERO,
        }
    }

    /// Replace the encoding preference list
    pub fn with_encodings(mut self, preferences: Vec<String>) -> Self {
        self.preferences = preferences;
        self
    }

    pub async fn get_state(&self) -> RecordingState {
        self.state.read().await.clone()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.encoding.as_str())
    }

    pub fn stats(&self) -> RecorderStats {
        let elapsed = match &self.active {
            Some(active) => active.started_at.elapsed(),
            None => self.last_elapsed,
        };
        RecorderStats {
            segments_produced: self.counters.produced.load(Ordering::SeqCst),
            segments_uploaded: self.counters.uploaded.load(Ordering::SeqCst),
            segments_failed: self.counters.failed.load(Ordering::SeqCst),
            segments_abandoned: self.counters.abandoned.load(Ordering::SeqCst),
            elapsed,
        }
    }

    /// Begin capturing `capture` with the first supported encoding.
    ///
    /// Failing to find an encoding, or to start capture, is fatal and
    /// leaves the recorder in `Error`.
    pub async fn start(&mut self, capture: Arc<dyn MediaCapture>) -> Result<mpsc::UnboundedReceiver<RecorderEvent>> {
        if self.active.is_some() {
            return Err(ProctorError::AlreadyStarted);
        }
        if self.config.segment_duration.is_zero() {
            let err = ProctorError::InvalidConfiguration("segment duration must be positive".into());
            tracing::error!(attempt_id = %self.attempt, error = %err, "Cannot start recording");
            *self.state.write().await = RecordingState::Error(err.to_string());
            return Err(err);
        }

        let Some(encoding) = select_encoding(capture.as_ref(), &self.preferences).map(str::to_string) else {
            let err = ProctorError::NoSupportedEncoding(self.preferences.clone());
            tracing::error!(attempt_id = %self.attempt, error = %err, "Cannot start recording");
            *self.state.write().await = RecordingState::Error(err.to_string());
            return Err(err);
        };

        let stream = match capture.begin(&encoding) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(attempt_id = %self.attempt, error = %e, "Failed to start capture");
                *self.state.write().await = RecordingState::Error(e.to_string());
                return Err(e);
            }
        };

        self.counters = Arc::new(RecorderCounters::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(UploadQueue::new());

        let worker = tokio::spawn(
            UploadWorker {
                attempt: self.attempt.clone(),
                uploader: self.uploader.clone(),
                queue: queue.clone(),
                max_attempts: self.config.upload_max_attempts,
                backoff_base: self.config.upload_backoff_base,
                counters: self.counters.clone(),
                events: events.clone(),
            }
            .run(),
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let capture_task = tokio::spawn(capture_loop(
            CaptureLoop {
                attempt: self.attempt.clone(),
                queue: queue.clone(),
                counters: self.counters.clone(),
                period: self.config.segment_duration,
                state: self.state.clone(),
                events: events.clone(),
                stop: stop_rx,
            },
            stream,
        ));

        *self.state.write().await = RecordingState::Recording;
        tracing::info!(
            attempt_id = %self.attempt,
            encoding = %encoding,
            segment_ms = self.config.segment_duration.as_millis() as u64,
            "Started recording"
        );

        self.active = Some(ActiveRecording {
            encoding,
            started_at: Instant::now(),
            stop_tx,
            capture_task,
            worker,
            queue,
            events,
        });
        Ok(events_rx)
    }

    /// Stop capture and wait up to the drain timeout for pending uploads.
    /// Whatever is still queued afterwards is abandoned. Idempotent.
    pub async fn stop(&mut self) -> RecorderStats {
        let Some(active) = self.active.take() else {
            return self.stats();
        };

        *self.state.write().await = RecordingState::Stopping;
        let _ = active.stop_tx.send(());
        if let Err(e) = active.capture_task.await {
            tracing::warn!(error = %e, "Capture task ended abnormally");
        }
        self.last_elapsed = active.started_at.elapsed();
        active.queue.close();

        let mut worker = active.worker;
        if tokio::time::timeout(self.config.drain_timeout, &mut worker).await.is_err() {
            worker.abort();
            let abandoned = active.queue.drain();
            tracing::warn!(
                attempt_id = %self.attempt,
                count = abandoned.len(),
                "Drain timeout expired, abandoning queued segments"
            );
            for segment in abandoned {
                self.counters.abandoned.fetch_add(1, Ordering::SeqCst);
                let _ = active.events.send(RecorderEvent::Abandoned { index: segment.index });
            }
        }

        {
            let mut state = self.state.write().await;
            if !matches!(*state, RecordingState::Error(_)) {
                *state = RecordingState::Stopped;
            }
        }

        let stats = self.stats();
        tracing::info!(
            attempt_id = %self.attempt,
            produced = stats.segments_produced,
            uploaded = stats.segments_uploaded,
            failed = stats.segments_failed,
            abandoned = stats.segments_abandoned,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Stopped recording"
        );
        stats
    }
}

struct CaptureLoop {
    attempt: AttemptSessionId,
    queue: Arc<UploadQueue>,
    counters: Arc<RecorderCounters>,
    period: Duration,
    state: Arc<RwLock<RecordingState>>,
    events: mpsc::UnboundedSender<RecorderEvent>,
    stop: oneshot::Receiver<()>,
}

impl CaptureLoop {
    fn enqueue(&self, sequence: &mut SegmentSequence, payload: bytes::Bytes) {
        // Empty slices produce no segment and consume no index
        if payload.is_empty() {
            return;
        }
        let segment = Segment::new(sequence.next_index(), payload, unix_millis());
        tracing::debug!(
            attempt_id = %self.attempt,
            segment_index = segment.index,
            size = segment.len(),
            "Captured segment"
        );
        self.counters.produced.fetch_add(1, Ordering::SeqCst);
        self.queue.push(segment);
    }
}

async fn capture_loop(mut job: CaptureLoop, mut stream: Box<dyn CaptureStream>) {
    let mut sequence = SegmentSequence::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + job.period, job.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failed = loop {
        tokio::select! {
            _ = ticker.tick() => match stream.take() {
                Ok(payload) => job.enqueue(&mut sequence, payload),
                Err(e) => {
                    tracing::error!(attempt_id = %job.attempt, error = %e, "Capture failed");
                    *job.state.write().await = RecordingState::Error(e.to_string());
                    let _ = job.events.send(RecorderEvent::Fatal(e.to_string()));
                    break true;
                }
            },
            _ = &mut job.stop => break false,
        }
    };

    // Finishing may wait on the capture pipeline for end of stream
    let flushed = tokio::task::spawn_blocking(move || stream.finish()).await;
    if failed {
        return;
    }
    match flushed {
        Ok(Ok(payload)) => job.enqueue(&mut sequence, payload),
        Ok(Err(e)) => tracing::warn!(attempt_id = %job.attempt, error = %e, "Failed to flush final segment"),
        Err(e) => tracing::warn!(attempt_id = %job.attempt, error = %e, "Final flush task failed"),
    }
}
