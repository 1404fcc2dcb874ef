use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use super::recorder::RecorderCounters;
use super::segment::{RecorderEvent, Segment};
use crate::error::{ProctorError, Result};
use crate::peer::exponential_delay;
use crate::signaling::AttemptSessionId;

const MAX_UPLOAD_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, attempt: &AttemptSessionId, segment: &Segment) -> Result<()>;
}

/// Multipart `POST {api_base}/attempts/{attemptId}/video-chunks`
pub struct HttpSegmentUploader {
    api_base_url: String,
    client: reqwest::Client,
}

impl HttpSegmentUploader {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProctorError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self, attempt: &AttemptSessionId) -> String {
        format!(
            "{}/attempts/{}/video-chunks",
            self.api_base_url,
            urlencoding::encode(attempt.as_str())
        )
    }
}

#[async_trait]
impl SegmentUploader for HttpSegmentUploader {
    async fn upload(&self, attempt: &AttemptSessionId, segment: &Segment) -> Result<()> {
        let chunk = Part::bytes(segment.payload.to_vec())
            .file_name(format!("chunk-{:06}.webm", segment.index))
            .mime_str("video/webm")
            .map_err(|e| ProctorError::InvalidUpload(e.to_string()))?;

        let form = Form::new()
            .part("chunk", chunk)
            .text("chunkIndex", segment.index.to_string())
            .text("capturedAt", segment.captured_at_ms.to_string());

        let response = self
            .client
            .post(self.endpoint(attempt))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProctorError::UploadRejected(status.as_u16()));
        }

        tracing::debug!(
            attempt_id = %attempt,
            segment_index = segment.index,
            size = segment.len(),
            "Uploaded segment"
        );
        Ok(())
    }
}

/// FIFO of segments awaiting upload. The recorder appends, the worker
/// removes the head only once it is resolved.
#[derive(Default)]
pub(crate) struct UploadQueue {
    items: Mutex<VecDeque<Segment>>,
    notify: Notify,
    closed: AtomicBool,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Segment>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, segment: Segment) {
        self.lock().push_back(segment);
        self.notify.notify_one();
    }

    pub fn front(&self) -> Option<Segment> {
        self.lock().front().cloned()
    }

    fn pop_front(&self) {
        self.lock().pop_front();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No more segments will be pushed
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn drain(&self) -> Vec<Segment> {
        self.lock().drain(..).collect()
    }
}

/// Drains the queue in index order. Segment `i + 1` is not attempted until
/// segment `i` is uploaded or dropped.
pub(crate) struct UploadWorker {
    pub attempt: AttemptSessionId,
    pub uploader: Arc<dyn SegmentUploader>,
    pub queue: Arc<UploadQueue>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub counters: Arc<RecorderCounters>,
    pub events: mpsc::UnboundedSender<RecorderEvent>,
}

impl UploadWorker {
    pub async fn run(self) {
        loop {
            let Some(mut segment) = self.queue.front() else {
                if self.queue.is_closed() {
                    break;
                }
                self.queue.notify.notified().await;
                continue;
            };

            let outcome = self.deliver(&mut segment).await;
            self.queue.pop_front();

            match outcome {
                Ok(()) => {
                    self.counters.uploaded.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(RecorderEvent::Uploaded {
                        index: segment.index,
                        attempts: segment.retry_count + 1,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        attempt_id = %self.attempt,
                        segment_index = segment.index,
                        error = %e,
                        "Dropping segment"
                    );
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(RecorderEvent::Dropped {
                        index: segment.index,
                        attempts: segment.retry_count,
                    });
                }
            }
        }
        tracing::debug!(attempt_id = %self.attempt, "Upload queue drained");
    }

    async fn deliver(&self, segment: &mut Segment) -> Result<()> {
        loop {
            match self.uploader.upload(&self.attempt, segment).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    segment.retry_count += 1;
                    if !e.is_retryable() || segment.retry_count >= self.max_attempts {
                        return Err(ProctorError::SegmentDropped {
                            index: segment.index,
                            attempts: segment.retry_count,
                        });
                    }
                    let delay = exponential_delay(self.backoff_base, segment.retry_count, MAX_UPLOAD_BACKOFF);
                    tracing::warn!(
                        segment_index = segment.index,
                        attempt = segment.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Segment upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    /// Fails each index a scripted number of times, then succeeds
    struct ScriptedUploader {
        failures: Mutex<HashMap<u64, u32>>,
        malformed: Vec<u64>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedUploader {
        fn new(failures: &[(u64, u32)]) -> Arc<Self> {
            Self::with_malformed(failures, &[])
        }

        /// `malformed` indices fail locally on every attempt
        fn with_malformed(failures: &[(u64, u32)], malformed: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.iter().copied().collect()),
                malformed: malformed.to_vec(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SegmentUploader for ScriptedUploader {
        async fn upload(&self, _attempt: &AttemptSessionId, segment: &Segment) -> Result<()> {
            self.calls.lock().unwrap().push(segment.index);
            if self.malformed.contains(&segment.index) {
                return Err(ProctorError::InvalidUpload("unencodable part".into()));
            }
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&segment.index) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(ProctorError::UploadRejected(503))
                }
                _ => Ok(()),
            }
        }
    }

    fn run_worker(
        uploader: Arc<ScriptedUploader>,
        segments: u64,
    ) -> (
        tokio::task::JoinHandle<()>,
        mpsc::UnboundedReceiver<RecorderEvent>,
        Arc<RecorderCounters>,
    ) {
        let queue = Arc::new(UploadQueue::new());
        for index in 0..segments {
            queue.push(Segment::new(index, Bytes::from_static(b"segment"), 0));
        }
        queue.close();

        let counters = Arc::new(RecorderCounters::default());
        let (events, rx) = mpsc::unbounded_channel();
        let worker = UploadWorker {
            attempt: AttemptSessionId::new("attempt-1"),
            uploader,
            queue,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            counters: counters.clone(),
            events,
        };
        (tokio::spawn(worker.run()), rx, counters)
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<RecorderEvent>) -> Vec<RecorderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_below_budget_eventually_upload() {
        let uploader = ScriptedUploader::new(&[(0, 2)]);
        let (handle, rx, counters) = run_worker(uploader.clone(), 1);
        handle.await.unwrap();

        assert_eq!(
            collect(rx),
            vec![RecorderEvent::Uploaded { index: 0, attempts: 3 }]
        );
        assert_eq!(counters.uploaded.load(Ordering::SeqCst), 1);
        assert_eq!(counters.failed.load(Ordering::SeqCst), 0);
        assert_eq!(uploader.calls(), vec![0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_segment_dropped_once_and_queue_proceeds() {
        let uploader = ScriptedUploader::new(&[(0, 10)]);
        let (handle, rx, counters) = run_worker(uploader.clone(), 2);
        handle.await.unwrap();

        assert_eq!(
            collect(rx),
            vec![
                RecorderEvent::Dropped { index: 0, attempts: 3 },
                RecorderEvent::Uploaded { index: 1, attempts: 1 },
            ]
        );
        assert_eq!(counters.failed.load(Ordering::SeqCst), 1);
        // Head-of-line: segment 1 only after segment 0 is resolved
        assert_eq!(uploader.calls(), vec![0, 0, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_failure_drops_without_retry() {
        let uploader = ScriptedUploader::with_malformed(&[], &[0]);
        let start = tokio::time::Instant::now();
        let (handle, rx, counters) = run_worker(uploader.clone(), 2);
        handle.await.unwrap();

        assert_eq!(
            collect(rx),
            vec![
                RecorderEvent::Dropped { index: 0, attempts: 1 },
                RecorderEvent::Uploaded { index: 1, attempts: 1 },
            ]
        );
        assert_eq!(counters.failed.load(Ordering::SeqCst), 1);
        assert_eq!(uploader.calls(), vec![0, 1]);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let uploader = ScriptedUploader::new(&[(0, 2)]);
        let start = tokio::time::Instant::now();
        let (handle, _rx, _counters) = run_worker(uploader, 1);
        handle.await.unwrap();

        // 500 ms after the first failure, 1000 ms after the second
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[test]
    fn test_endpoint_encodes_attempt_id() {
        let uploader = HttpSegmentUploader::new("http://api.local/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            uploader.endpoint(&AttemptSessionId::new("attempt 42")),
            "http://api.local/attempts/attempt%2042/video-chunks"
        );
    }
}
