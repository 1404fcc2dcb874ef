use bytes::{Bytes, BytesMut};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CaptureStream, LocalTrack, MediaCapture, MediaSource};
use crate::error::{ProctorError, Result};

const WIDTH: i32 = 640;
const HEIGHT: i32 = 480;
const FRAMERATE: i32 = 15;

type RecordingInput = Arc<Mutex<Option<gst_app::AppSrc>>>;

#[derive(Debug, Clone)]
pub enum GstSourceKind {
    /// `videotestsrc`, no hardware needed
    TestPattern,
    /// `v4l2src` on the given device node
    Camera { device: String },
}

/// Camera (or test pattern) feeding a VP8 WebRTC track and, on demand, a
/// WebM recording pipeline.
///
/// `src -> videoconvert -> caps -> tee -> vp8enc -> appsink(live)`
/// `                               tee -> appsink(raw) -> [recording appsrc]`
pub struct GstMediaSource {
    id: String,
    pipeline: gst::Pipeline,
    video_track: Arc<TrackLocalStaticSample>,
    recording_input: RecordingInput,
    sample_writer: JoinHandle<()>,
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create {}: {}", factory, e)))
}

fn raw_caps() -> gst::Caps {
    gst_video::VideoCapsBuilder::new()
        .format(gst_video::VideoFormat::I420)
        .width(WIDTH)
        .height(HEIGHT)
        .framerate(gst::Fraction::new(FRAMERATE, 1))
        .build()
}

fn as_appsink(element: gst::Element) -> Result<gst_app::AppSink> {
    element
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| ProctorError::internal("Failed to cast to AppSink"))
}

impl GstMediaSource {
    /// Build and start the capture pipeline. Must be called inside a tokio runtime.
    pub fn new(id: impl Into<String>, kind: GstSourceKind) -> Result<Self> {
        gst::init().map_err(|e| ProctorError::MediaSourceUnavailable(format!("GStreamer init failed: {}", e)))?;
        let id = id.into();

        let source = match &kind {
            GstSourceKind::TestPattern => gst::ElementFactory::make("videotestsrc")
                .property("is-live", true)
                .build(),
            GstSourceKind::Camera { device } => gst::ElementFactory::make("v4l2src")
                .property("device", device.as_str())
                .build(),
        }
        .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create video source: {}", e)))?;

        let videoconvert = make("videoconvert")?;
        let videoscale = make("videoscale")?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", raw_caps())
            .build()
            .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create capsfilter: {}", e)))?;
        let tee = make("tee")?;

        let live_queue = make("queue")?;
        let vp8enc = gst::ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("cpu-used", 4i32)
            .property("keyframe-max-dist", 30i32)
            .build()
            .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create vp8enc: {}", e)))?;
        let live_sink = as_appsink(
            gst::ElementFactory::make("appsink")
                .name("live")
                .property("sync", false)
                .build()
                .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create appsink: {}", e)))?,
        )?;

        let raw_queue = make("queue")?;
        let raw_sink = as_appsink(
            gst::ElementFactory::make("appsink")
                .name("raw")
                .property("sync", false)
                .property("max-buffers", 4u32)
                .property("drop", true)
                .build()
                .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to create appsink: {}", e)))?,
        )?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([
                &source,
                &videoconvert,
                &videoscale,
                &capsfilter,
                &tee,
                &live_queue,
                &vp8enc,
                live_sink.upcast_ref(),
                &raw_queue,
                raw_sink.upcast_ref(),
            ])
            .map_err(|e| ProctorError::internal(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([&source, &videoconvert, &videoscale, &capsfilter, &tee])
            .map_err(|e| ProctorError::internal(format!("Failed to link source: {}", e)))?;
        gst::Element::link_many([&tee, &live_queue, &vp8enc, live_sink.upcast_ref()])
            .map_err(|e| ProctorError::internal(format!("Failed to link live branch: {}", e)))?;
        gst::Element::link_many([&tee, &raw_queue, raw_sink.upcast_ref()])
            .map_err(|e| ProctorError::internal(format!("Failed to link raw branch: {}", e)))?;

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            id.clone(),
        ));

        let (sample_tx, mut sample_rx) = mpsc::unbounded_channel::<Sample>();
        let frame_duration = Duration::from_millis(1000 / FRAMERATE as u64);
        live_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let duration = buffer
                        .duration()
                        .map(|d| Duration::from_nanos(d.nseconds()))
                        .unwrap_or(frame_duration);
                    let sample = Sample {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        duration,
                        ..Default::default()
                    };
                    if sample_tx.send(sample).is_err() {
                        return Err(gst::FlowError::Eos);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let recording_input: RecordingInput = Arc::new(Mutex::new(None));
        let raw_input = recording_input.clone();
        raw_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let active = raw_input.lock().ok().and_then(|slot| slot.clone());
                    if let (Some(appsrc), Some(buffer)) = (active, sample.buffer_owned()) {
                        // A stopping recorder may reject buffers; the source keeps running
                        let _ = appsrc.push_buffer(buffer);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let writer_track = video_track.clone();
        let sample_writer = tokio::spawn(async move {
            while let Some(sample) = sample_rx.recv().await {
                if let Err(e) = writer_track.write_sample(&sample).await {
                    tracing::debug!(error = %e, "Failed to write video sample");
                }
            }
        });

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ProctorError::MediaSourceUnavailable(format!("Failed to start pipeline: {}", e)))?;

        tracing::info!(source_id = %id, kind = ?kind, "Media source started");

        Ok(Self {
            id,
            pipeline,
            video_track,
            recording_input,
            sample_writer,
        })
    }

    /// Stop capture. Called by the owner, never by sessions or the recorder.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.recording_input.lock() {
            slot.take();
        }
        let _ = self.pipeline.set_state(gst::State::Null);
        self.sample_writer.abort();
        tracing::info!(source_id = %self.id, "Media source stopped");
    }
}

impl Drop for GstMediaSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MediaSource for GstMediaSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<LocalTrack> {
        vec![self.video_track.clone() as LocalTrack]
    }
}

fn encoder_for(encoding: &str) -> Option<&'static str> {
    match encoding {
        "video/webm;codecs=vp9" => Some("vp9enc"),
        "video/webm;codecs=vp8" | "video/webm" => Some("vp8enc"),
        _ => None,
    }
}

impl MediaCapture for GstMediaSource {
    fn supports(&self, encoding: &str) -> bool {
        match encoder_for(encoding) {
            Some(encoder) => {
                gst::ElementFactory::find(encoder).is_some()
                    && gst::ElementFactory::find("webmmux").is_some()
            }
            None => false,
        }
    }

    fn begin(&self, encoding: &str) -> Result<Box<dyn CaptureStream>> {
        let encoder_name = encoder_for(encoding)
            .ok_or_else(|| ProctorError::NoSupportedEncoding(vec![encoding.to_string()]))?;

        let appsrc = make("appsrc")?
            .dynamic_cast::<gst_app::AppSrc>()
            .map_err(|_| ProctorError::internal("Failed to cast to AppSrc"))?;
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);
        appsrc.set_do_timestamp(true);
        appsrc.set_caps(Some(&raw_caps()));

        let videoconvert = make("videoconvert")?;
        let encoder = gst::ElementFactory::make(encoder_name)
            .property("deadline", 1i64)
            .property("cpu-used", 4i32)
            .build()
            .map_err(|e| ProctorError::Capture(format!("Failed to create {}: {}", encoder_name, e)))?;
        let webmmux = gst::ElementFactory::make("webmmux")
            .property("streamable", true)
            .build()
            .map_err(|e| ProctorError::Capture(format!("Failed to create webmmux: {}", e)))?;
        let sink = as_appsink(
            gst::ElementFactory::make("appsink")
                .property("sync", false)
                .build()
                .map_err(|e| ProctorError::Capture(format!("Failed to create appsink: {}", e)))?,
        )?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &videoconvert,
                &encoder,
                &webmmux,
                sink.upcast_ref(),
            ])
            .map_err(|e| ProctorError::Capture(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder,
            &webmmux,
            sink.upcast_ref(),
        ])
        .map_err(|e| ProctorError::Capture(format!("Failed to link recording pipeline: {}", e)))?;

        let buffered = Arc::new(Mutex::new(BytesMut::new()));
        let sink_buffer = buffered.clone();
        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    if let Ok(mut data) = sink_buffer.lock() {
                        data.extend_from_slice(map.as_slice());
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ProctorError::Capture(format!("Failed to start recording pipeline: {}", e)))?;

        if let Ok(mut slot) = self.recording_input.lock() {
            *slot = Some(appsrc.clone());
        }

        tracing::info!(source_id = %self.id, encoding = %encoding, "Recording capture started");

        Ok(Box::new(GstCaptureStream {
            pipeline,
            appsrc,
            buffered,
            recording_input: self.recording_input.clone(),
            finished: false,
        }))
    }
}

struct GstCaptureStream {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    buffered: Arc<Mutex<BytesMut>>,
    recording_input: RecordingInput,
    finished: bool,
}

impl GstCaptureStream {
    fn drain(&self) -> Result<Bytes> {
        let mut data = self
            .buffered
            .lock()
            .map_err(|_| ProctorError::Capture("capture buffer poisoned".into()))?;
        Ok(data.split().freeze())
    }
}

impl CaptureStream for GstCaptureStream {
    fn take(&mut self) -> Result<Bytes> {
        self.drain()
    }

    fn finish(&mut self) -> Result<Bytes> {
        if self.finished {
            return Ok(Bytes::new());
        }
        self.finished = true;

        if let Ok(mut slot) = self.recording_input.lock() {
            slot.take();
        }
        let _ = self.appsrc.end_of_stream();

        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(_) => break,
                    gst::MessageView::Error(err) => {
                        tracing::warn!(error = %err.error(), "Recording pipeline error during finish");
                        break;
                    }
                    _ => {}
                }
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| ProctorError::Capture(format!("Failed to stop recording pipeline: {}", e)))?;

        self.drain()
    }
}

impl Drop for GstCaptureStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
    }
}
