use bytes::BufMut;
use futures::TryStreamExt;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::reply::Response;
use warp::{Filter, Reply};

use super::relay_websocket::{self, RelayHub};
use crate::capability::{RelayServer, VideoCapabilityConfig};
use crate::error::{ProctorError, Result};

const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Every route the development relay serves
pub fn routes(
    hub: RelayHub,
    output_dir: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    relay_websocket_route(hub)
        .or(health_check())
        .or(video_config_endpoint())
        .or(video_chunk_upload(output_dir))
}

pub fn relay_websocket_route(
    hub: RelayHub,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("relay")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_hub(hub))
        .map(|ws: warp::ws::Ws, hub: RelayHub| {
            ws.on_upgrade(move |websocket| relay_websocket::handle_relay_websocket(websocket, hub))
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "proctor-relay",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

pub fn video_config_endpoint(
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("video" / "config")
        .and(warp::get())
        .map(|| warp::reply::json(&capability_from_env()))
}

/// Capability document assembled from the relay's environment
pub fn capability_from_env() -> VideoCapabilityConfig {
    use std::env;

    let flag = |name: &str| {
        env::var(name)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    };

    let mut relay_servers = Vec::new();
    if let Ok(stun) = env::var("STUN_SERVER_URL") {
        relay_servers.push(RelayServer {
            urls: vec![stun],
            username: None,
            credential: None,
        });
    }
    if let Ok(turn) = env::var("TURN_SERVER_URL") {
        relay_servers.push(RelayServer {
            urls: vec![turn],
            username: env::var("TURN_USERNAME").ok(),
            credential: env::var("TURN_CREDENTIAL").ok(),
        });
    }

    VideoCapabilityConfig {
        enable_live_video: flag("ENABLE_LIVE_VIDEO"),
        enable_video_recording: flag("ENABLE_VIDEO_RECORDING"),
        enable_smart_monitoring: flag("ENABLE_SMART_MONITORING"),
        relay_servers,
    }
}

/// `POST /attempts/{attemptId}/video-chunks`, stored under `output_dir`
pub fn video_chunk_upload(
    output_dir: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("attempts" / String / "video-chunks")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_CHUNK_BYTES))
        .and(warp::any().map(move || output_dir.clone()))
        .and_then(handle_chunk_upload)
}

/// Parsed multipart body of one segment upload
#[derive(Debug, Default)]
struct ChunkUpload {
    index: Option<u64>,
    captured_at: Option<u64>,
    payload: Option<Vec<u8>>,
}

async fn handle_chunk_upload(
    attempt: String,
    form: FormData,
    output_dir: String,
) -> std::result::Result<Response, Infallible> {
    let upload = match read_chunk_form(form).await {
        Ok(upload) => upload,
        Err(e) => return Ok(error_reply(StatusCode::BAD_REQUEST, &e)),
    };

    match store_chunk(Path::new(&output_dir), &attempt, upload).await {
        Ok((index, path)) => {
            tracing::info!(attempt_id = %attempt, chunk_index = index, path = %path.display(), "Stored video chunk");
            let body = warp::reply::json(&serde_json::json!({
                "status": "created",
                "chunkIndex": index
            }));
            Ok(warp::reply::with_status(body, StatusCode::CREATED).into_response())
        }
        Err(e @ ProctorError::InvalidUpload(_)) => Ok(error_reply(StatusCode::BAD_REQUEST, &e)),
        Err(e) => {
            tracing::error!(attempt_id = %attempt, error = %e, "Failed to store video chunk");
            Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e))
        }
    }
}

fn error_reply(status: StatusCode, error: &ProctorError) -> Response {
    let body = warp::reply::json(&serde_json::json!({ "error": error.to_string() }));
    warp::reply::with_status(body, status).into_response()
}

async fn read_chunk_form(form: FormData) -> Result<ChunkUpload> {
    let parts: Vec<Part> = form
        .try_collect()
        .await
        .map_err(|e| ProctorError::InvalidUpload(e.to_string()))?;

    let mut upload = ChunkUpload::default();
    for part in parts {
        let name = part.name().to_string();
        let data = read_part(part).await?;
        match name.as_str() {
            "chunk" => upload.payload = Some(data),
            "chunkIndex" => upload.index = Some(parse_number(&name, &data)?),
            "capturedAt" => upload.captured_at = Some(parse_number(&name, &data)?),
            _ => {}
        }
    }
    Ok(upload)
}

async fn read_part(part: Part) -> Result<Vec<u8>> {
    part.stream()
        .try_fold(Vec::new(), |mut data, buf| async move {
            data.put(buf);
            Ok(data)
        })
        .await
        .map_err(|e| ProctorError::InvalidUpload(e.to_string()))
}

fn parse_number(field: &str, data: &[u8]) -> Result<u64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| ProctorError::InvalidUpload(format!("{} is not a number", field)))
}

/// Attempt ids become directory names; anything outside `[A-Za-z0-9_-]`
/// is replaced
fn attempt_dir_name(attempt: &str) -> Result<String> {
    let decoded = urlencoding::decode(attempt)
        .map_err(|_| ProctorError::InvalidUpload("attempt id is not valid UTF-8".into()))?;
    let name: String = decoded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '_') {
        return Err(ProctorError::InvalidUpload("empty attempt id".into()));
    }
    Ok(name)
}

async fn store_chunk(output_dir: &Path, attempt: &str, upload: ChunkUpload) -> Result<(u64, PathBuf)> {
    let index = upload
        .index
        .ok_or_else(|| ProctorError::InvalidUpload("missing chunkIndex".into()))?;
    let payload = upload
        .payload
        .ok_or_else(|| ProctorError::InvalidUpload("missing chunk".into()))?;
    if payload.is_empty() {
        return Err(ProctorError::InvalidUpload("empty chunk".into()));
    }

    let dir = output_dir.join(attempt_dir_name(attempt)?);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ProctorError::internal(format!("Failed to create {}: {}", dir.display(), e)))?;

    let path = dir.join(format!("{:06}.webm", index));
    tokio::fs::write(&path, &payload)
        .await
        .map_err(|e| ProctorError::internal(format!("Failed to write {}: {}", path.display(), e)))?;

    tracing::debug!(
        chunk_index = index,
        captured_at = ?upload.captured_at,
        size = payload.len(),
        "Wrote video chunk"
    );
    Ok((index, path))
}

fn with_hub(hub: RelayHub) -> impl Filter<Extract = (RelayHub,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_dir_name_is_sanitized() {
        assert_eq!(attempt_dir_name("attempt-42").unwrap(), "attempt-42");
        assert_eq!(attempt_dir_name("..%2F..%2Fetc").unwrap(), "______etc");
        assert!(attempt_dir_name("..").is_err());
    }

    #[tokio::test]
    async fn test_health_check_reports_service() {
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&health_check())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["service"], "proctor-relay");
    }

    #[tokio::test]
    async fn test_video_config_uses_capability_field_names() {
        let response = warp::test::request()
            .method("GET")
            .path("/video/config")
            .reply(&video_config_endpoint())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body.get("enableLiveVideo").is_some());
        assert!(body.get("relayServers").is_some());
    }

    #[tokio::test]
    async fn test_chunk_upload_writes_indexed_file() {
        let dir = std::env::temp_dir().join(format!("proctor-chunks-{}", rand::random::<u32>()));
        let boundary = "chunk-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"chunkIndex\"\r\n\r\n7\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"capturedAt\"\r\n\r\n1700000000000\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"chunk-000007.webm\"\r\n\
             Content-Type: video/webm\r\n\r\nwebm-bytes\r\n--{b}--\r\n",
            b = boundary
        );

        let response = warp::test::request()
            .method("POST")
            .path("/attempts/attempt-1/video-chunks")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(body)
            .reply(&video_chunk_upload(dir.to_string_lossy().into_owned()))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let stored = std::fs::read(dir.join("attempt-1").join("000007.webm")).unwrap();
        assert_eq!(stored, b"webm-bytes");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_chunk_upload_without_index_is_rejected() {
        let boundary = "chunk-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"c.webm\"\r\n\r\nbytes\r\n--{b}--\r\n",
            b = boundary
        );

        let response = warp::test::request()
            .method("POST")
            .path("/attempts/attempt-1/video-chunks")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(body)
            .reply(&video_chunk_upload(std::env::temp_dir().to_string_lossy().into_owned()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
