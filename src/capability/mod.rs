//! Video feature flags and relay (STUN/TURN) servers.
//!
//! Fetched once per process and cached. Failures degrade to an all-disabled
//! document instead of reaching callers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{ProctorError, Result};

const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCapabilityConfig {
    #[serde(default)]
    pub enable_live_video: bool,
    #[serde(default)]
    pub enable_video_recording: bool,
    #[serde(default)]
    pub enable_smart_monitoring: bool,
    #[serde(default)]
    pub relay_servers: Vec<RelayServer>,
}

impl VideoCapabilityConfig {
    /// Conservative fallback used whenever the real document is unavailable
    pub fn disabled() -> Self {
        Self::default()
    }

    /// An empty list means host candidates only
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        ice_servers(&self.relay_servers)
    }
}

pub fn ice_servers(relay_servers: &[RelayServer]) -> Vec<RTCIceServer> {
    relay_servers
        .iter()
        .map(|server| match (&server.username, &server.credential) {
            (Some(username), Some(credential)) => RTCIceServer {
                urls: server.urls.clone(),
                username: username.clone(),
                credential: credential.clone(),
                credential_type: RTCIceCredentialType::Password,
            },
            _ => RTCIceServer {
                urls: server.urls.clone(),
                ..Default::default()
            },
        })
        .collect()
}

#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn fetch(&self) -> Result<VideoCapabilityConfig>;
}

/// `GET {api_base}/video/config`
pub struct HttpCapabilitySource {
    url: String,
    client: reqwest::Client,
}

impl HttpCapabilitySource {
    pub fn new(api_base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CONFIG_FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProctorError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: format!("{}/video/config", api_base_url.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl CapabilitySource for HttpCapabilitySource {
    async fn fetch(&self) -> Result<VideoCapabilityConfig> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ProctorError::network(format!(
                "capability config returned {}",
                response.status()
            )));
        }
        Ok(response.json::<VideoCapabilityConfig>().await?)
    }
}

/// A fixed document, for tests and offline runs
pub struct StaticCapabilitySource(pub VideoCapabilityConfig);

#[async_trait]
impl CapabilitySource for StaticCapabilitySource {
    async fn fetch(&self) -> Result<VideoCapabilityConfig> {
        Ok(self.0.clone())
    }
}

/// Process-scoped fetch-once cache.
///
/// The first `get()` performs the fetch; concurrent callers wait for it.
/// Only successful fetches are cached. `reset()` forgets the cached document
/// (logout, test teardown).
pub struct CapabilityCache {
    source: Arc<dyn CapabilitySource>,
    cached: Mutex<Option<VideoCapabilityConfig>>,
}

impl CapabilityCache {
    pub fn new(source: Arc<dyn CapabilitySource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub fn with_config(config: VideoCapabilityConfig) -> Self {
        Self::new(Arc::new(StaticCapabilitySource(config)))
    }

    pub async fn get(&self) -> VideoCapabilityConfig {
        let mut cached = self.cached.lock().await;
        if let Some(config) = cached.as_ref() {
            return config.clone();
        }

        match self.source.fetch().await {
            Ok(config) => {
                tracing::info!(
                    live_video = config.enable_live_video,
                    recording = config.enable_video_recording,
                    relay_servers = config.relay_servers.len(),
                    "Fetched video capability config"
                );
                *cached = Some(config.clone());
                config
            }
            Err(e) => {
                tracing::warn!(error = %e, "Capability config unavailable, video features disabled");
                VideoCapabilityConfig::disabled()
            }
        }
    }

    pub async fn reset(&self) {
        *self.cached.lock().await = None;
    }
}
