use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::peer::ReconnectPolicy;

pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub timing: TimingConfig,
    pub recording: RecordingConfig,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Endpoints used by the candidate and proctor sides
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
    /// Base URL of the HTTP API (capability config, segment uploads)
    pub api_base_url: String,
}

/// Delays and budgets driving negotiation and reconnection
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// How long the viewer waits after a candidate join before asking for an offer
    pub renegotiation_grace: Duration,
    /// How long a disconnected peer connection may recover on its own
    pub disconnect_grace: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub reconnect_max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub segment_duration: Duration,
    pub upload_max_attempts: u32,
    pub upload_backoff_base: Duration,
    pub drain_timeout: Duration,
    /// Where the development relay stores uploaded segments
    pub output_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/relay".to_string(),
            api_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            renegotiation_grace: Duration::from_millis(2000),
            disconnect_grace: Duration::from_millis(2000),
            reconnect_base: Duration::from_millis(1000),
            reconnect_cap: Duration::from_millis(30_000),
            reconnect_max_attempts: 6,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(3),
            upload_max_attempts: 3,
            upload_backoff_base: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            output_dir: "./recordings".to_string(),
        }
    }
}

impl TimingConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: self.reconnect_base,
            cap: self.reconnect_cap,
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let server_defaults = ServerConfig::default();
        let client_defaults = ClientConfig::default();
        let timing_defaults = TimingConfig::default();
        let recording_defaults = RecordingConfig::default();

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(server_defaults.host),
                port: parse_var("SERVER_PORT", server_defaults.port),
            },
            client: ClientConfig {
                relay_url: env::var("RELAY_URL").unwrap_or(client_defaults.relay_url),
                api_base_url: env::var("API_BASE_URL").unwrap_or(client_defaults.api_base_url),
            },
            timing: TimingConfig {
                renegotiation_grace: millis_var(
                    "RENEGOTIATION_GRACE_MS",
                    timing_defaults.renegotiation_grace,
                ),
                disconnect_grace: millis_var("DISCONNECT_GRACE_MS", timing_defaults.disconnect_grace),
                reconnect_base: millis_var("RECONNECT_BASE_MS", timing_defaults.reconnect_base),
                reconnect_cap: millis_var("RECONNECT_CAP_MS", timing_defaults.reconnect_cap),
                reconnect_max_attempts: parse_var(
                    "RECONNECT_MAX_ATTEMPTS",
                    timing_defaults.reconnect_max_attempts,
                ),
            },
            recording: RecordingConfig {
                segment_duration: positive_millis_var(
                    "SEGMENT_DURATION_MS",
                    recording_defaults.segment_duration,
                ),
                upload_max_attempts: parse_var(
                    "UPLOAD_MAX_ATTEMPTS",
                    recording_defaults.upload_max_attempts,
                ),
                upload_backoff_base: millis_var(
                    "UPLOAD_BACKOFF_BASE_MS",
                    recording_defaults.upload_backoff_base,
                ),
                drain_timeout: millis_var("UPLOAD_DRAIN_TIMEOUT_MS", recording_defaults.drain_timeout),
                output_dir: env::var("RECORDING_OUTPUT_DIR")
                    .unwrap_or(recording_defaults.output_dir),
            },
        }
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn millis_var(name: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_var(name, default.as_millis() as u64))
}

/// Like `millis_var`, but zero falls back to the default
fn positive_millis_var(name: &str, default: Duration) -> Duration {
    let value = millis_var(name, default);
    if value.is_zero() {
        tracing::warn!(var = name, default_ms = default.as_millis() as u64, "Zero duration, using default");
        return default;
    }
    value
}
