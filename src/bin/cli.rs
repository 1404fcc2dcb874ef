// Proctoring transport CLI
// Drives publisher, viewer and recorder sessions against a relay, or both
// sides in-process for a loopback check

use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use proctor_link::capability::{CapabilityCache, HttpCapabilitySource, VideoCapabilityConfig};
use proctor_link::config::Config;
use proctor_link::media::{GstMediaSource, GstSourceKind};
use proctor_link::peer::{ConnectionState, PublisherSession, ViewerSession, WebRtcPeerFactory};
use proctor_link::recording::{HttpSegmentUploader, RecorderEvent, SegmentRecorder};
use proctor_link::signaling::{AttemptSessionId, MemoryRelay, WsSignalingChannel};
use proctor_link::{logging, ProctorError, Result};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctoring transport CLI", long_about = None)]
struct Cli {
    /// Relay WebSocket URL (default: RELAY_URL)
    #[arg(short, long)]
    relay: Option<String>,

    /// HTTP API base URL (default: API_BASE_URL)
    #[arg(short, long)]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check relay health endpoint
    Health,

    /// Show the video capability document
    Config,

    /// Publish the candidate's camera for an attempt
    Publish {
        /// Exam attempt ID
        #[arg(long)]
        attempt: String,

        /// V4L2 device; a test pattern is used when omitted
        #[arg(long)]
        device: Option<String>,

        /// Also record and upload segments when recording is enabled
        #[arg(long)]
        record: bool,
    },

    /// Watch an attempt as proctor (press Ctrl+C to exit)
    Watch {
        /// Exam attempt ID
        #[arg(long)]
        attempt: String,
    },

    /// Connect a publisher and a viewer through an in-process relay
    Loopback {
        /// Seconds to wait for both sides to go live
        #[arg(long, default_value_t = 20)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    logging::init("warn,proctor_link=info");
    let mut config = Config::from_env();

    if let Some(relay) = &cli.relay {
        config.client.relay_url = relay.clone();
    }
    if let Some(api) = &cli.api {
        config.client.api_base_url = api.clone();
    }

    let result = match &cli.command {
        Commands::Health => check_health(&config).await,
        Commands::Config => check_config(&config).await,
        Commands::Publish {
            attempt,
            device,
            record,
        } => publish(&config, attempt, device.clone(), *record).await,
        Commands::Watch { attempt } => watch_attempt(&config, attempt).await,
        Commands::Loopback { wait } => loopback(&config, Duration::from_secs(*wait)).await,
    };

    if let Err(e) = result {
        println!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

async fn check_health(config: &Config) -> Result<()> {
    println!("{}", "Checking relay health...".cyan());

    let url = format!("{}/health", config.client.api_base_url.trim_end_matches('/'));
    let resp = reqwest::Client::new().get(&url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ProctorError::network(format!("health check returned {}", status)));
    }

    println!("{} Health check passed", "✓".green());
    if let Ok(body) = resp.json::<serde_json::Value>().await {
        println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
        println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
        println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
    }
    Ok(())
}

async fn check_config(config: &Config) -> Result<()> {
    println!("{}", "Fetching video capability config...".cyan());

    let capabilities = capability_cache(config)?.get().await;
    print_flag("Live video", capabilities.enable_live_video);
    print_flag("Video recording", capabilities.enable_video_recording);
    print_flag("Smart monitoring", capabilities.enable_smart_monitoring);

    if capabilities.relay_servers.is_empty() {
        println!("  Relay servers: none (host candidates only)");
    }
    for server in &capabilities.relay_servers {
        let auth = if server.username.is_some() { " (authenticated)" } else { "" };
        println!("  Relay server: {}{}", server.urls.join(", "), auth);
    }
    Ok(())
}

fn print_flag(name: &str, enabled: bool) {
    if enabled {
        println!("{} {}", "✓".green(), name);
    } else {
        println!("{} {} disabled", "-".yellow(), name);
    }
}

fn capability_cache(config: &Config) -> Result<Arc<CapabilityCache>> {
    let source = HttpCapabilitySource::new(&config.client.api_base_url)?;
    Ok(Arc::new(CapabilityCache::new(Arc::new(source))))
}

async fn publish(config: &Config, attempt: &str, device: Option<String>, record: bool) -> Result<()> {
    let attempt = AttemptSessionId::new(attempt);
    println!("{} {}", "Publishing attempt".cyan(), attempt.to_string().bold());

    let kind = match device {
        Some(device) => GstSourceKind::Camera { device },
        None => GstSourceKind::TestPattern,
    };
    let media = Arc::new(GstMediaSource::new(format!("camera-{}", attempt), kind)?);

    let capabilities = capability_cache(config)?;
    let channel = Arc::new(WsSignalingChannel::new(config.client.relay_url.clone()));
    let factory = Arc::new(WebRtcPeerFactory::new()?);

    let mut publisher = PublisherSession::new(
        attempt.clone(),
        channel,
        factory,
        capabilities.clone(),
        config.timing.clone(),
    );
    publisher.start(media.clone()).await?;
    println!("{} Joined relay, waiting for a proctor", "✓".green());

    let mut recorder = None;
    if record {
        if capabilities.get().await.enable_video_recording {
            let uploader = Arc::new(HttpSegmentUploader::new(&config.client.api_base_url, UPLOAD_TIMEOUT)?);
            let mut segment_recorder =
                SegmentRecorder::new(attempt.clone(), uploader, config.recording.clone());
            let events = segment_recorder.start(media.clone()).await?;
            tokio::spawn(print_recorder_events(events));
            println!(
                "{} Recording as {}",
                "✓".green(),
                segment_recorder.encoding().unwrap_or("unknown")
            );
            recorder = Some(segment_recorder);
        } else {
            println!("{} Video recording disabled by capability config", "-".yellow());
        }
    }

    let status = tokio::spawn(print_status("publisher", publisher.status()));
    let _ = tokio::signal::ctrl_c().await;
    println!("\n{}", "Stopping...".yellow());

    publisher.stop().await;
    status.abort();
    if let Some(mut recorder) = recorder {
        let stats = recorder.stop().await;
        println!(
            "  Segments: {} produced, {} uploaded, {} failed, {} abandoned",
            stats.segments_produced,
            stats.segments_uploaded,
            stats.segments_failed,
            stats.segments_abandoned
        );
    }
    media.shutdown();
    Ok(())
}

async fn watch_attempt(config: &Config, attempt: &str) -> Result<()> {
    let attempt = AttemptSessionId::new(attempt);
    println!("{} {}", "Watching attempt".cyan(), attempt.to_string().bold());

    let channel = Arc::new(WsSignalingChannel::new(config.client.relay_url.clone()));
    let factory = Arc::new(WebRtcPeerFactory::new()?);
    let mut viewer = ViewerSession::new(
        attempt,
        channel,
        factory,
        capability_cache(config)?,
        config.timing.clone(),
    );

    let mut notifications = viewer.connect().await?;
    println!("{} Joined relay, waiting for the candidate", "✓".green());

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => println!("{}", notification.to_json()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\n{}", "Stopping...".yellow());
    viewer.disconnect().await;
    Ok(())
}

async fn loopback(config: &Config, wait: Duration) -> Result<()> {
    println!("\n{}", "Loopback: publisher -> in-process relay -> viewer".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let attempt = AttemptSessionId::new("loopback");
    let relay = Arc::new(MemoryRelay::new());
    let factory = Arc::new(WebRtcPeerFactory::new()?);
    let capabilities = Arc::new(CapabilityCache::with_config(VideoCapabilityConfig {
        enable_live_video: true,
        ..VideoCapabilityConfig::disabled()
    }));
    let media = Arc::new(GstMediaSource::new("loopback-pattern", GstSourceKind::TestPattern)?);

    let mut publisher = PublisherSession::new(
        attempt.clone(),
        relay.clone(),
        factory.clone(),
        capabilities.clone(),
        config.timing.clone(),
    );
    let mut viewer = ViewerSession::new(
        attempt,
        relay.clone(),
        factory,
        capabilities,
        config.timing.clone(),
    );

    publisher.start(media.clone()).await?;
    println!("{} Publisher joined", "✓".green());
    let _notifications = viewer.connect().await?;
    println!("{} Viewer joined", "✓".green());

    let both_live = async {
        let publisher_live = wait_for_live(publisher.status());
        let viewer_live = wait_for_live(viewer.status());
        tokio::join!(publisher_live, viewer_live)
    };
    let outcome = timeout(wait, both_live).await;

    println!("  Offers relayed: {}", relay.delivered("Offer").len());
    println!("  Answers relayed: {}", relay.delivered("Answer").len());

    viewer.disconnect().await;
    publisher.stop().await;
    media.shutdown();

    match outcome {
        Ok((true, true)) => {
            println!("{} Both sides live", "✓".green());
            Ok(())
        }
        Ok(_) => Err(ProctorError::internal("a session reached a terminal state")),
        Err(_) => Err(ProctorError::Timeout(format!("not live within {:?}", wait))),
    }
}

/// True once live, false if the session gives up first
async fn wait_for_live(mut status: watch::Receiver<ConnectionState>) -> bool {
    loop {
        let state = *status.borrow_and_update();
        match state {
            ConnectionState::Live => return true,
            state if state.is_terminal() => return false,
            _ => {}
        }
        if status.changed().await.is_err() {
            return false;
        }
    }
}

async fn print_status(side: &'static str, mut status: watch::Receiver<ConnectionState>) {
    while status.changed().await.is_ok() {
        let state = *status.borrow_and_update();
        let label = match state {
            ConnectionState::Live => state.as_str().green(),
            ConnectionState::Failed | ConnectionState::Offline => state.as_str().red(),
            _ => state.as_str().yellow(),
        };
        println!("{} {} {}", "▶".cyan(), side, label);
    }
}

async fn print_recorder_events(mut events: tokio::sync::mpsc::UnboundedReceiver<RecorderEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RecorderEvent::Uploaded { index, attempts } => {
                println!("{} segment {} uploaded ({} attempt(s))", "✓".green(), index, attempts)
            }
            RecorderEvent::Dropped { index, attempts } => {
                println!("{} segment {} dropped after {} attempts", "✗".red(), index, attempts)
            }
            RecorderEvent::Abandoned { index } => {
                println!("{} segment {} abandoned", "✗".red(), index)
            }
            RecorderEvent::Fatal(reason) => println!("{} recording stopped: {}", "✗".red(), reason),
        }
    }
}
