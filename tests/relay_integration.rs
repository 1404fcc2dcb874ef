// Integration tests for the development relay
// A real warp server on an ephemeral port, driven by the library's clients

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use proctor_link::api::{self, RelayHub};
use proctor_link::capability::{CapabilitySource, HttpCapabilitySource};
use proctor_link::recording::{HttpSegmentUploader, Segment, SegmentUploader};
use proctor_link::signaling::{
    AttemptSessionId, PeerRole, SignalingChannel, SignalingConnection, SignalingEvent,
    SignalingMessage, TransportEvent, WsSignalingChannel,
};
use tokio::time::timeout;

fn start_relay(output_dir: PathBuf) -> SocketAddr {
    let routes = api::routes(RelayHub::new(), output_dir.to_string_lossy().into_owned());
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("proctor-relay-{}", rand::random::<u32>()))
}

async fn next_message(connection: &mut SignalingConnection) -> SignalingMessage {
    loop {
        let event = timeout(Duration::from_secs(5), connection.events.recv())
            .await
            .expect("relay event within 5s")
            .expect("event stream open");
        match event {
            SignalingEvent::Message(message) => return message,
            SignalingEvent::Transport(_) => continue,
        }
    }
}

#[tokio::test]
async fn test_websocket_room_exchange() {
    let addr = start_relay(scratch_dir());
    let channel = WsSignalingChannel::new(format!("ws://{}/relay", addr));
    let attempt = AttemptSessionId::new("attempt-ws");

    let mut candidate = channel.connect(&attempt, PeerRole::Candidate).await.unwrap();
    assert!(matches!(
        candidate.events.recv().await,
        Some(SignalingEvent::Transport(TransportEvent::Connected))
    ));

    let mut proctor = channel.connect(&attempt, PeerRole::Proctor).await.unwrap();
    let proctor_id = proctor.link.connection_id().clone();

    match next_message(&mut candidate).await {
        SignalingMessage::RoomJoined { role, connection_id } => {
            assert_eq!(role, PeerRole::Proctor);
            assert_eq!(connection_id, proctor_id);
        }
        other => panic!("unexpected: {:?}", other),
    }
    match next_message(&mut proctor).await {
        SignalingMessage::RoomJoined { role, .. } => assert_eq!(role, PeerRole::Candidate),
        other => panic!("unexpected: {:?}", other),
    }

    proctor
        .link
        .send(
            SignalingMessage::RenegotiationRequested {
                from_connection_id: Some(proctor_id.clone()),
            },
            Some(candidate.link.connection_id()),
        )
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut candidate).await,
        SignalingMessage::RenegotiationRequested {
            from_connection_id: Some(proctor_id.clone()),
        }
    );

    proctor.link.disconnect().await;
    assert_eq!(
        next_message(&mut candidate).await,
        SignalingMessage::RoomLeft {
            connection_id: proctor_id
        }
    );
}

#[tokio::test]
async fn test_displaced_connection_is_closed() {
    let addr = start_relay(scratch_dir());
    let channel = WsSignalingChannel::new(format!("ws://{}/relay", addr));
    let attempt = AttemptSessionId::new("attempt-displace");

    let mut first = channel.connect(&attempt, PeerRole::Proctor).await.unwrap();
    let _second = channel.connect(&attempt, PeerRole::Proctor).await.unwrap();

    let mut disconnected = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), first.events.recv()).await {
        if event == SignalingEvent::Transport(TransportEvent::Disconnected) {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected);
}

#[tokio::test]
async fn test_capability_document_round_trip() {
    let addr = start_relay(scratch_dir());
    let source = HttpCapabilitySource::new(&format!("http://{}", addr)).unwrap();
    // Flags depend on the environment; the document must parse either way
    source.fetch().await.unwrap();
}

#[tokio::test]
async fn test_segment_upload_lands_on_disk() {
    let dir = scratch_dir();
    let addr = start_relay(dir.clone());
    let uploader = HttpSegmentUploader::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
    let attempt = AttemptSessionId::new("attempt-upload");

    let segment = Segment::new(3, Bytes::from_static(b"\x1a\x45\xdf\xa3webm"), 1_700_000_000_000);
    uploader.upload(&attempt, &segment).await.unwrap();

    let stored = std::fs::read(dir.join("attempt-upload").join("000003.webm")).unwrap();
    assert_eq!(stored, segment.payload.to_vec());
    let _ = std::fs::remove_dir_all(dir);
}
