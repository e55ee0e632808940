//! Multi-hop requests end to end: the request travels as a zero-timeout
//! frame carrying the full hop path, the reply comes back as a notification
//! and resolves the ticket.

use std::time::Duration;

use bytes::Bytes;
use lantern_core::wire::decode_hop_request;
use lantern_link::ConnectorKind;
use lantern_runtime::{CorrelatorError, HopDescriptor, RuntimeEvent};

use crate::support::{wait_for_event, SimHarness};

fn hop(address: u32) -> HopDescriptor {
    HopDescriptor {
        address,
        connector_kind: ConnectorKind::Simulated,
    }
}

#[tokio::test]
async fn hop_request_round_trips_through_the_notification_path() {
    let harness = SimHarness::new();
    harness.connect().await;

    let response = harness
        .runtime
        .remote_request(&[hop(0x0101)], Bytes::from_static(b"telemetry?"), None)
        .await
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"telemetry?"));
}

#[tokio::test]
async fn concurrent_hop_requests_resolve_to_their_own_payloads() {
    let harness = SimHarness::new();
    harness.connect().await;

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let runtime = harness.runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .remote_request(&[hop(0x0101)], Bytes::from(vec![i; 16]), None)
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response, Bytes::from(vec![i as u8; 16]));
    }
}

#[tokio::test]
async fn two_hop_path_travels_on_the_wire() {
    let harness = SimHarness::new();
    harness.connect().await;
    harness.device.add_peer(0x0202);

    let response = harness
        .runtime
        .remote_request(
            &[hop(0x0101), hop(0x0202)],
            Bytes::from_static(b"config?"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"config?"));

    // The ordered hop list is serialized into the request body.
    let paths: Vec<Vec<u32>> = harness
        .device
        .frames_received()
        .iter()
        .filter_map(|(_, payload)| decode_hop_request(payload).map(|(_, path, _)| path))
        .collect();
    assert!(paths.contains(&vec![0x0101, 0x0202]));
}

#[tokio::test]
async fn unregistered_hop_address_is_unreachable() {
    let harness = SimHarness::new();
    harness.connect().await;

    let err = harness
        .runtime
        .remote_request(&[hop(0x0101), hop(0x0404)], Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    assert_eq!(err, CorrelatorError::HopUnreachable);
}

#[tokio::test]
async fn peer_membership_changes_surface_as_events_and_routes() {
    let harness = SimHarness::new();
    harness.connect().await;
    let mut events = harness.runtime.subscribe();
    harness.settle(&mut events).await;

    harness.connector().simulate_peer_join(0x0202);
    wait_for_event(&mut events, Duration::from_secs(1), |event| {
        matches!(event, RuntimeEvent::PeerConnected { address: 0x0202 })
    })
    .await
    .unwrap();

    let response = harness
        .runtime
        .remote_request(&[hop(0x0101), hop(0x0202)], Bytes::from_static(b"up?"), None)
        .await
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"up?"));

    harness.connector().simulate_peer_leave(0x0202);
    wait_for_event(&mut events, Duration::from_secs(1), |event| {
        matches!(event, RuntimeEvent::PeerDisconnected { address: 0x0202 })
    })
    .await
    .unwrap();

    let err = harness
        .runtime
        .remote_request(&[hop(0x0101), hop(0x0202)], Bytes::from_static(b"up?"), None)
        .await
        .unwrap_err();
    assert_eq!(err, CorrelatorError::HopUnreachable);
}

#[tokio::test]
async fn empty_path_is_rejected_before_sending() {
    let harness = SimHarness::new();
    harness.connect().await;

    let err = harness
        .runtime
        .remote_request(&[], Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    assert_eq!(err, CorrelatorError::InvalidPath);
    // Nothing was enqueued, nothing was written.
    assert_eq!(
        harness.device.frame_count(),
        1,
        "only the connect clock handshake reached the device"
    );
}

#[tokio::test]
async fn mismatched_first_hop_kind_fails_initiation() {
    let harness = SimHarness::new();
    harness.connect().await;

    let ble_hop = HopDescriptor {
        address: 0x0303,
        connector_kind: ConnectorKind::Ble,
    };
    let err = harness
        .runtime
        .remote_request(&[ble_hop], Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::InitiationFailed(_)));
}
