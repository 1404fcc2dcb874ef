// End-to-end session scenarios over the in-process relay
// Publisher and viewer run their real state machines; peer connections are fakes

mod support;

use std::sync::Arc;
use std::time::Duration;

use proctor_link::peer::{
    ConnectionState, PeerConnectionState, PublisherSession, SignalingState, ViewerNotification, ViewerSession,
};
use proctor_link::signaling::{
    IceCandidatePayload, MemoryRelay, PeerRole, SignalingChannel, SignalingMessage, ViolationEvent,
};
use proctor_link::ProctorError;

use support::*;

struct Pair {
    relay: MemoryRelay,
    publisher_peers: Arc<FakePeerFactory>,
    viewer_peers: Arc<FakePeerFactory>,
    publisher: PublisherSession,
    viewer: ViewerSession,
}

fn pair() -> Pair {
    let relay = MemoryRelay::new();
    let publisher_peers = FakePeerFactory::new();
    let viewer_peers = FakePeerFactory::new();
    let channel = Arc::new(relay.clone());

    let publisher = PublisherSession::new(
        attempt(),
        channel.clone(),
        publisher_peers.clone(),
        live_video(),
        timing(),
    );
    let viewer = ViewerSession::new(attempt(), channel, viewer_peers.clone(), live_video(), timing());

    Pair {
        relay,
        publisher_peers,
        viewer_peers,
        publisher,
        viewer,
    }
}

/// Both sides joined and live after a single handshake
async fn live_pair() -> (Pair, tokio::sync::mpsc::UnboundedReceiver<ViewerNotification>) {
    let mut pair = pair();
    pair.publisher.start(camera()).await.unwrap();
    let notifications = pair.viewer.connect().await.unwrap();

    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
    (pair, notifications)
}

#[tokio::test(start_paused = true)]
async fn test_single_handshake_reaches_live() {
    let (mut pair, mut notifications) = live_pair().await;

    assert_eq!(pair.relay.delivered("Offer").len(), 1);
    assert_eq!(pair.relay.delivered("Answer").len(), 1);
    assert_eq!(pair.publisher_peers.created(), 1);
    assert_eq!(pair.viewer_peers.created(), 1);
    assert!(pair.publisher_peers.latest().has_media);
    assert!(!pair.viewer_peers.latest().has_media);

    // Each side's local candidate reached the other
    settle().await;
    assert_eq!(pair.publisher_peers.latest().remote_candidates().len(), 1);
    assert_eq!(pair.viewer_peers.latest().remote_candidates().len(), 1);

    let mut statuses = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        if let ViewerNotification::Status(state) = notification {
            statuses.push(state);
        }
    }
    assert_eq!(statuses.last(), Some(&ConnectionState::Live));

    pair.viewer.disconnect().await;
    pair.publisher.stop().await;
    assert_eq!(pair.publisher_peers.open_peers(), 0);
    assert_eq!(pair.viewer_peers.open_peers(), 0);
    assert_eq!(pair.publisher.state(), ConnectionState::Idle);
    assert_eq!(pair.viewer.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_alone_never_offers() {
    let mut pair = pair();
    pair.publisher.start(camera()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(pair.relay.journal().iter().all(|m| m.message.kind() != "Offer"));
    assert_eq!(pair.publisher.state(), ConnectionState::Connecting);

    let _notifications = pair.viewer.connect().await.unwrap();
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
    assert_eq!(pair.relay.delivered("Offer").len(), 1);
    assert_eq!(pair.relay.delivered("Answer").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_asks_silent_candidate_after_grace() {
    let mut pair = pair();
    let _notifications = pair.viewer.connect().await.unwrap();
    settle().await;

    // Joined without learning the proctor is there, so it never offers
    let silent = pair.relay.connect(&attempt(), PeerRole::Candidate).await.unwrap();
    let silent_id = silent.link.connection_id().clone();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pair.relay.delivered("RenegotiationRequested").is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let requests = pair.relay.delivered("RenegotiationRequested");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target.as_ref(), Some(&silent_id));
    assert_eq!(pair.viewer_peers.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_first_still_single_offer() {
    let mut pair = pair();
    let _notifications = pair.viewer.connect().await.unwrap();
    settle().await;
    pair.publisher.start(camera()).await.unwrap();

    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;

    // Grace timer must not produce a second handshake
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pair.relay.delivered("Offer").len(), 1);
    assert_eq!(pair.relay.delivered("RenegotiationRequested").len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_viewer_rejoin_keeps_one_connection() {
    let mut pair = pair();
    pair.publisher.start(camera()).await.unwrap();

    for _ in 0..5 {
        let _notifications = pair.viewer.connect().await.unwrap();
        pair.viewer.disconnect().await;
    }
    let _notifications = pair.viewer.connect().await.unwrap();

    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
    settle().await;

    assert_eq!(pair.publisher_peers.open_peers(), 1);
    assert_eq!(pair.viewer_peers.open_peers(), 1);
    assert_eq!(pair.relay.delivered("Answer").len(), 1);
    assert_eq!(pair.publisher_peers.latest().remote_answers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_answer_and_candidates_are_ignored() {
    let (pair, _notifications) = live_pair().await;
    let viewer_id = occupant(&pair.relay, PeerRole::Proctor);

    // Hold the viewer's answer back so the publisher stays mid-handshake
    pair.relay.set_message_filter(|message| message.kind() != "Answer");
    pair.relay.publish(
        &attempt(),
        SignalingMessage::RenegotiationRequested {
            from_connection_id: Some(viewer_id.clone()),
        },
    );
    settle().await;
    assert_eq!(pair.publisher_peers.created(), 2);
    assert_eq!(pair.publisher.state(), ConnectionState::Connecting);

    let stale_candidate = IceCandidatePayload {
        candidate: "candidate:9 1 udp 2122260223 10.0.0.9 50009 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    pair.relay.publish(
        &attempt(),
        SignalingMessage::Answer {
            sdp: "answer-from-first-handshake".to_string(),
            from_connection_id: viewer_id.clone(),
            negotiation_id: Some(1),
        },
    );
    pair.relay.publish(
        &attempt(),
        SignalingMessage::IceCandidate {
            payload: stale_candidate,
            from_connection_id: Some(viewer_id.clone()),
            target_connection_id: None,
            negotiation_id: Some(1),
        },
    );
    settle().await;

    let current = pair.publisher_peers.latest();
    assert_eq!(current.remote_answers(), 0);
    assert!(current.remote_candidates().is_empty());
    assert_eq!(pair.publisher.state(), ConnectionState::Connecting);

    pair.relay.clear_message_filter();
    pair.relay.publish(
        &attempt(),
        SignalingMessage::Answer {
            sdp: "answer-for-second-handshake".to_string(),
            from_connection_id: viewer_id,
            negotiation_id: Some(2),
        },
    );
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;

    assert_eq!(current.remote_answers(), 1);
    // The viewer's candidate for handshake 2 was queued, then applied
    assert_eq!(current.remote_candidates().len(), 1);
    assert_eq!(pair.publisher_peers.open_peers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_relay_drop_recovers() {
    let (pair, mut notifications) = live_pair().await;
    let mut publisher_status = pair.publisher.status();

    assert!(pair.relay.drop_transport(&attempt(), PeerRole::Candidate));
    wait_for_state(&mut publisher_status, ConnectionState::Reconnecting).await;

    let relay = pair.relay.clone();
    eventually("second answer relayed", || relay.delivered("Answer").len() == 2).await;
    wait_for_state(&mut publisher_status, ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;

    assert_eq!(pair.publisher_peers.open_peers(), 1);
    assert_eq!(pair.viewer_peers.open_peers(), 1);

    let mut saw_candidate_left = false;
    while let Ok(notification) = notifications.try_recv() {
        if notification == ViewerNotification::CandidateLeft {
            saw_candidate_left = true;
        }
    }
    assert!(saw_candidate_left);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_transport_blip_requests_fresh_offer() {
    let (pair, _notifications) = live_pair().await;

    assert!(pair.relay.interrupt_transport(&attempt(), PeerRole::Proctor));
    let relay = pair.relay.clone();
    eventually("renegotiation requested", || {
        relay.delivered("RenegotiationRequested").len() == 1
    })
    .await;
    eventually("second answer relayed", || relay.delivered("Answer").len() == 2).await;

    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
    assert_eq!(pair.viewer_peers.open_peers(), 1);
    assert_eq!(pair.publisher_peers.open_peers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_answer_needs_pending_local_offer() {
    let (pair, _notifications) = live_pair().await;
    let viewer_id = occupant(&pair.relay, PeerRole::Proctor);

    pair.relay.set_message_filter(|message| message.kind() != "Answer");
    pair.relay.publish(
        &attempt(),
        SignalingMessage::RenegotiationRequested {
            from_connection_id: Some(viewer_id.clone()),
        },
    );
    settle().await;
    assert_eq!(pair.publisher_peers.created(), 2);
    let current = pair.publisher_peers.latest();

    let answer = SignalingMessage::Answer {
        sdp: "answer-for-second-handshake".to_string(),
        from_connection_id: viewer_id,
        negotiation_id: Some(2),
    };
    current.force_signaling(SignalingState::Stable);
    pair.relay.publish(&attempt(), answer.clone());
    settle().await;
    assert_eq!(current.answer_calls(), 0);
    assert_eq!(pair.publisher.state(), ConnectionState::Connecting);

    // The handshake is still expected once the offer is pending again
    current.force_signaling(SignalingState::HaveLocalOffer);
    pair.relay.publish(&attempt(), answer);
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;
    assert_eq!(current.remote_answers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_disconnect_requests_offer_after_grace() {
    let (pair, _notifications) = live_pair().await;

    pair.viewer_peers.latest().inject(PeerConnectionState::Disconnected);
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Reconnecting).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pair.relay.delivered("RenegotiationRequested").is_empty());

    let relay = pair.relay.clone();
    eventually("renegotiation requested after grace", || {
        relay.delivered("RenegotiationRequested").len() == 1
    })
    .await;
    eventually("second answer relayed", || relay.delivered("Answer").len() == 2).await;
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;

    assert_eq!(pair.relay.delivered("RenegotiationRequested").len(), 1);
    assert_eq!(pair.viewer_peers.open_peers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_closed_peer_fails() {
    let (pair, _notifications) = live_pair().await;

    pair.publisher_peers.latest().inject(PeerConnectionState::Closed);
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Failed).await;
    assert_eq!(pair.publisher_peers.open_peers(), 0);
    assert!(pair
        .relay
        .occupants(&attempt())
        .iter()
        .all(|(role, _)| *role != PeerRole::Candidate));

    // No automatic recovery from a closed connection
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pair.publisher.state(), ConnectionState::Failed);
    assert_eq!(pair.publisher_peers.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_closed_peer_goes_offline() {
    let (pair, _notifications) = live_pair().await;

    pair.viewer_peers.latest().inject(PeerConnectionState::Closed);
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Offline).await;
    assert_eq!(pair.viewer_peers.open_peers(), 0);
    assert!(pair
        .relay
        .occupants(&attempt())
        .iter()
        .all(|(role, _)| *role != PeerRole::Proctor));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pair.viewer.state(), ConnectionState::Offline);
    assert_eq!(pair.viewer_peers.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_peer_tries_ice_restart_in_place() {
    let (pair, _notifications) = live_pair().await;
    let publisher_peer = pair.publisher_peers.latest();

    publisher_peer.inject(PeerConnectionState::Disconnected);
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Reconnecting).await;
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;

    let offers = pair.relay.delivered("Offer");
    assert_eq!(offers.len(), 2);
    assert!(matches!(
        offers[1].message,
        SignalingMessage::Offer { ice_restart: true, .. }
    ));
    assert_eq!(publisher_peer.ice_restarts(), 1);
    // Same connections, renegotiated in place
    assert_eq!(pair.publisher_peers.created(), 1);
    assert_eq!(pair.viewer_peers.created(), 1);
    assert_eq!(pair.viewer_peers.latest().remote_offers(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_peer_is_rebuilt() {
    let (pair, _notifications) = live_pair().await;

    pair.publisher_peers.latest().inject(PeerConnectionState::Failed);
    let relay = pair.relay.clone();
    eventually("rebuilt connection answered", || relay.delivered("Answer").len() == 2).await;
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Live).await;

    assert_eq!(pair.publisher_peers.created(), 2);
    assert_eq!(pair.publisher_peers.open_peers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_signaling_budget_exhaustion_fails() {
    let (pair, _notifications) = live_pair().await;
    let connects_before = pair.relay.connect_attempts();
    let started = tokio::time::Instant::now();

    pair.relay.fail_next_connects(u32::MAX);
    pair.relay.drop_transport(&attempt(), PeerRole::Candidate);
    wait_for_state(&mut pair.publisher.status(), ConnectionState::Failed).await;

    assert_eq!(pair.relay.connect_attempts() - connects_before, 6);
    // 1 + 2 + 4 + 8 + 16 + 30 seconds of backoff
    assert!(started.elapsed() >= Duration::from_secs(61));
    assert_eq!(pair.publisher_peers.open_peers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_signaling_budget_exhaustion_goes_offline() {
    let (mut pair, _notifications) = live_pair().await;

    pair.relay.fail_next_connects(u32::MAX);
    pair.relay.drop_transport(&attempt(), PeerRole::Proctor);
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Offline).await;
    assert_eq!(pair.viewer_peers.open_peers(), 0);

    // Terminal until the owner reconnects explicitly
    pair.relay.fail_next_connects(0);
    let _notifications = pair.viewer.connect().await.unwrap();
    wait_for_state(&mut pair.viewer.status(), ConnectionState::Live).await;
}

#[tokio::test(start_paused = true)]
async fn test_viewer_forwards_session_control_messages() {
    let (pair, mut notifications) = live_pair().await;
    while notifications.try_recv().is_ok() {}

    let violation = ViolationEvent {
        id: "v-1".to_string(),
        attempt_id: attempt(),
        event_type: "TAB_SWITCH".to_string(),
        metadata: serde_json::json!({ "count": 2 }),
        occurred_at: "2026-01-01T10:00:00Z".to_string(),
        severity: "medium".to_string(),
    };
    pair.relay
        .publish(&attempt(), SignalingMessage::ViolationEvent(violation.clone()));
    pair.relay
        .publish(&attempt(), SignalingMessage::ExamSubmitted { attempt_id: attempt() });
    settle().await;

    assert_eq!(
        notifications.try_recv().unwrap(),
        ViewerNotification::Violation(violation)
    );
    assert_eq!(
        notifications.try_recv().unwrap(),
        ViewerNotification::ExamSubmitted { attempt_id: attempt() }
    );
    // Neither affects the live link
    assert_eq!(pair.viewer.state(), ConnectionState::Live);
}

#[tokio::test(start_paused = true)]
async fn test_start_guards() {
    let relay = MemoryRelay::new();
    let factory = FakePeerFactory::new();

    let mut disabled = PublisherSession::new(
        attempt(),
        Arc::new(relay.clone()),
        factory.clone(),
        video_disabled(),
        timing(),
    );
    assert!(matches!(
        disabled.start(camera()).await,
        Err(ProctorError::FeatureDisabled(_))
    ));
    assert_eq!(factory.created(), 0);

    let mut publisher = PublisherSession::new(
        attempt(),
        Arc::new(relay.clone()),
        factory.clone(),
        live_video(),
        timing(),
    );
    relay.fail_next_connects(1);
    assert!(publisher.start(camera()).await.is_err());
    assert_eq!(publisher.state(), ConnectionState::Idle);

    publisher.start(camera()).await.unwrap();
    assert!(matches!(
        publisher.start(camera()).await,
        Err(ProctorError::AlreadyStarted)
    ));

    publisher.stop().await;
    publisher.stop().await;
    assert_eq!(publisher.state(), ConnectionState::Idle);
    assert_eq!(factory.open_peers(), 0);
}
