//! Link lifecycle: clock handshake, duplicate platform events, response
//! timeouts and connector replacement.

use std::time::Duration;

use bytes::Bytes;
use lantern_core::LanternConfig;
use lantern_link::{ConnectorKind, OtaStatus};
use lantern_runtime::{RuntimeError, RuntimeEvent};

use crate::support::{wait_for_event, SimHarness};

fn fast_config() -> LanternConfig {
    let mut config = LanternConfig::default();
    config.link.response_grace_ms = 20;
    config.timeouts.clock_ms = 50;
    config
}

#[tokio::test]
async fn connect_seeds_the_clock_from_the_controller() {
    let harness = SimHarness::new();
    harness.device.clock().set_millis(120_000);
    harness.connect().await;

    let millis = harness.runtime.clock().millis();
    assert!((120_000..125_000).contains(&millis));
}

#[tokio::test]
async fn connect_survives_a_failed_clock_handshake() {
    let harness = SimHarness::with_config(fast_config());
    harness.device.clock().set_millis(99_000);
    harness.device.set_drop_responses(true);
    harness.connect().await;

    assert!(harness.runtime.connected().await.is_some());
    // Handshake failed, so the local clock starts from zero.
    assert!(harness.runtime.clock().millis() < 10_000);
}

#[tokio::test]
async fn duplicate_platform_events_are_suppressed() {
    let harness = SimHarness::new();
    harness.connect().await;

    let mut events = harness.runtime.subscribe();
    harness.settle(&mut events).await;

    // A second connected event from the platform while already connected
    // must not leak through.
    harness.connector().simulate_platform_connect_event();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());

    harness.connector().simulate_platform_disconnect_event();
    harness.connector().simulate_platform_disconnect_event();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(events.try_recv(), Ok(RuntimeEvent::Disconnected)));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn lost_response_times_out_and_drops_the_link() {
    let harness = SimHarness::with_config(fast_config());
    harness.connect().await;

    let mut events = harness.runtime.subscribe();
    harness.settle(&mut events).await;
    harness.device.set_drop_responses(true);

    let err = harness
        .runtime
        .request(
            Bytes::from_static(b"identity?"),
            true,
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::Connector(lantern_link::ConnectorError::ResponseTimeout));

    assert!(harness.runtime.connected().await.is_none());
    wait_for_event(&mut events, Duration::from_secs(1), |event| {
        matches!(event, RuntimeEvent::Disconnected)
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn firmware_update_reports_progress_over_the_event_bus() {
    let harness = SimHarness::new();
    harness.connect().await;

    let mut events = harness.runtime.subscribe();
    harness.settle(&mut events).await;

    let firmware = Bytes::from(vec![0xAB; 1500]);
    harness.runtime.update_firmware(firmware).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("ota events arrive")
            .unwrap();
        let done = matches!(event, RuntimeEvent::OtaStatus(OtaStatus::Success));
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(matches!(seen.first(), Some(RuntimeEvent::OtaStatus(OtaStatus::Begin))));
    assert!(matches!(seen.last(), Some(RuntimeEvent::OtaStatus(OtaStatus::Success))));

    let final_progress = seen
        .iter()
        .filter_map(|event| match event {
            RuntimeEvent::OtaProgress { written, total } => Some((*written, *total)),
            _ => None,
        })
        .last()
        .expect("at least one progress event");
    assert_eq!(final_progress, (1500, 1500));
}

#[tokio::test]
async fn destroyed_connector_is_rebuilt_on_reassignment() {
    let harness = SimHarness::new();
    harness.connect().await;
    assert_eq!(harness.factory_calls(), 1);

    harness.runtime.destroy_connector().await.unwrap();
    let err = harness
        .runtime
        .execute(Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::ConnectorNotAssigned);

    harness.runtime.set_connector(Some(ConnectorKind::Simulated));
    harness.connect().await;
    assert_eq!(harness.factory_calls(), 2);
    assert!(harness.runtime.connected().await.is_some());
}
