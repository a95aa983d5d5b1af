//! Two transport services exchanging envelopes on loopback.

mod common;

use std::time::{Duration, Instant};

use common::{random_bytes, wait_for_queued, LOCALHOST};
use lanlink_core::config::{LocalIdentity, TransportConfig};
use lanlink_core::discovery::Peer;
use lanlink_core::protocol::{Envelope, MessageKind};
use lanlink_core::transport::{TransportEvent, TransportService};

const MAX: usize = 256 * 1024;

async fn service() -> TransportService {
    let service = TransportService::new(TransportConfig {
        port: 0,
        bind_address: LOCALHOST,
        max_message_size: MAX,
        connect_timeout: Duration::from_secs(2),
    })
    .await
    .unwrap();
    service.start().await.unwrap();
    service
}

fn peer_of(id: &str, service: &TransportService) -> Peer {
    Peer::new(id, id, LOCALHOST, service.local_addr().port(), Instant::now())
}

fn received(event: &TransportEvent) -> Option<Envelope> {
    match event {
        TransportEvent::MessageReceived { envelope, .. } => Some(envelope.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn test_conversation_over_one_connection() {
    let a = service().await;
    let b = service().await;
    let alice = LocalIdentity::new("a1", "Alice");
    let bob = LocalIdentity::new("b1", "Bob");
    let mut a_events = a.take_events().await.unwrap();
    let mut b_events = b.take_events().await.unwrap();

    a.send(&Envelope::text_message(&alice, "b1", "hi"), &peer_of("b1", &b))
        .await
        .unwrap();
    let hi = wait_for_queued(&mut b_events, received).await;
    assert_eq!(hi.text(), Some("hi"));
    assert_eq!(hi.sender_id(), "a1");

    // Bob answers through the connection Alice opened.
    assert!(b.is_connected("a1").await);
    b.send(&Envelope::text_message(&bob, "a1", "bye"), &peer_of("a1", &a))
        .await
        .unwrap();
    let bye = wait_for_queued(&mut a_events, received).await;
    assert_eq!(bye.text(), Some("bye"));
    assert_eq!(a.connection_count().await, 1);
    assert_eq!(b.connection_count().await, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_large_image_near_limit() {
    let a = service().await;
    let b = service().await;
    let alice = LocalIdentity::new("a1", "Alice");
    let mut b_events = b.take_events().await.unwrap();

    let image = random_bytes(MAX - 1024);
    a.send(&Envelope::image_message(&alice, "b1", image.clone()), &peer_of("b1", &b))
        .await
        .unwrap();

    let envelope = wait_for_queued(&mut b_events, received).await;
    assert_eq!(envelope.kind(), MessageKind::ImageMessage);
    assert_eq!(envelope.data(), image.as_slice());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_stopped_peer_reports_closed_connection() {
    let a = service().await;
    let b = service().await;
    let alice = LocalIdentity::new("a1", "Alice");
    let mut b_events = b.take_events().await.unwrap();

    a.send(&Envelope::text_message(&alice, "b1", "hi"), &peer_of("b1", &b))
        .await
        .unwrap();
    wait_for_queued(&mut b_events, received).await;

    a.stop().await;

    let closed = wait_for_queued(&mut b_events, |e| match e {
        TransportEvent::ConnectionClosed { peer_id, .. } => Some(peer_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(closed.as_deref(), Some("a1"));
    assert!(!b.is_connected("a1").await);

    b.stop().await;
}
