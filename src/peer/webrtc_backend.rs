use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use super::connection::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerSpec,
    RemoteTrackInfo, SignalingState,
};
use crate::capability::ice_servers;
use crate::error::{ProctorError, Result};
use crate::signaling::IceCandidatePayload;

pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();

    // RTCP feedback for keyframe recovery
    let video_rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ];

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_string(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| ProctorError::webrtc_api(format!("Failed to register VP8 codec: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| ProctorError::webrtc_api(format!("Failed to register Opus codec: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // IPv4 only, avoids IPv6 binding errors on hosts without v6 routes
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    setting_engine.set_ice_multicast_dns_mode(webrtc::ice::mdns::MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    Ok(Arc::new(api))
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

/// Peer connections backed by the `webrtc` crate
pub struct WebRtcPeerFactory {
    api: Arc<API>,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, spec: PeerSpec) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers(&spec.relay_servers),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| ProctorError::PeerConnectionCreation(e.to_string()))?,
        );

        if let Some(media) = &spec.media {
            for track in media.tracks() {
                let rtp_sender = peer_connection
                    .add_track(track)
                    .await
                    .map_err(|e| ProctorError::PeerConnectionCreation(format!("Failed to add track: {}", e)))?;

                // Interceptors need incoming RTCP to be read
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
                });
            }
        }

        let generation = spec.events.generation();

        let state_sink = spec.events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!(generation, state = %state, "Peer connection state changed");
            state_sink.emit(PeerEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        let candidate_sink = spec.events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let track_sink = spec.events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            track_sink.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
                track_id: track.id(),
                kind: track.kind().to_string(),
                stream_id: track.stream_id(),
            }));
            // Rendering is the owner's concern; keep the RTP buffers drained
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeerConnection { peer_connection }))
    }
}

pub struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| ProctorError::CreateOfferFailed(e.to_string()))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| ProctorError::CreateOfferFailed(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| ProctorError::CreateAnswerFailed(e.to_string()))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| ProctorError::CreateAnswerFailed(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| ProctorError::AddIceCandidateFailed(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}
