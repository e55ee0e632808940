//! Controller engine boundary: decoded notifications reach the embedded
//! engine carrying the identity of the connected controller, and requests
//! addressed to this instance are answered back over the link.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lantern_core::wire::{
    encode_frame, encode_hop_request, encode_hop_response, SyncRecord, FRAME_EXECUTE,
    FRAME_REQUEST, FRAME_SYNC,
};
use lantern_link::ConnectorKind;
use lantern_runtime::{Connection, ControllerEngine};
use zerocopy::AsBytes;

use crate::support::SimHarness;

#[derive(Default)]
struct RecordingEngine {
    executes: Mutex<Vec<(Bytes, Option<Connection>)>>,
    syncs: Mutex<Vec<Option<Connection>>>,
    requests: Mutex<Vec<(Bytes, Option<Connection>)>>,
}

#[async_trait::async_trait]
impl ControllerEngine for RecordingEngine {
    async fn execute(&self, payload: Bytes, source: Option<Connection>) -> anyhow::Result<()> {
        self.executes.lock().unwrap().push((payload, source));
        Ok(())
    }

    async fn request(&self, payload: Bytes, source: Option<Connection>) -> anyhow::Result<Bytes> {
        let reply = Bytes::from(format!("ack:{}", payload.len()));
        self.requests.lock().unwrap().push((payload, source));
        Ok(reply)
    }

    async fn synchronize(
        &self,
        _record: SyncRecord,
        source: Option<Connection>,
    ) -> anyhow::Result<()> {
        self.syncs.lock().unwrap().push(source);
        Ok(())
    }
}

#[tokio::test]
async fn broadcast_execute_reaches_the_engine_with_its_source() {
    let engine = Arc::new(RecordingEngine::default());
    let harness = SimHarness::with_engine(engine.clone());
    harness.connect().await;

    let frame = encode_frame(FRAME_EXECUTE, 0, b"scene.next()").unwrap().freeze();
    harness.connector().push_notification(frame);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let executes = engine.executes.lock().unwrap();
    assert_eq!(executes.len(), 1);
    assert_eq!(executes[0].0.as_ref(), b"scene.next()");
    let source = executes[0].1.clone().expect("source identifies the device");
    assert_eq!(source.address, 0x0101);
    assert_eq!(source.connector_kind, ConnectorKind::Simulated);
    assert_eq!(source.rssi, -55);
}

#[tokio::test]
async fn sync_records_reach_the_engine_with_their_source() {
    let engine = Arc::new(RecordingEngine::default());
    let harness = SimHarness::with_engine(engine.clone());
    harness.connect().await;

    let record = SyncRecord {
        history_fingerprint: 1,
        tngl_fingerprint: 2,
        clock_timestamp: 500_000,
        timeline_clock_timestamp: 0,
        tngl_clock_timestamp: 0,
        fw_compilation_timestamp: 0,
        origin_address: 0x0101,
    };
    let frame = encode_frame(FRAME_SYNC, 0, record.as_bytes()).unwrap().freeze();
    harness.connector().push_notification(frame);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let syncs = engine.syncs.lock().unwrap();
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].is_some());
}

#[tokio::test]
async fn inbound_request_is_answered_over_the_link() {
    let engine = Arc::new(RecordingEngine::default());
    let harness = SimHarness::with_engine(engine.clone());
    harness.connect().await;
    let before = harness.device.frame_count();

    let body = encode_hop_request(0x77, &[0x0101], b"whoami?");
    let frame = encode_frame(FRAME_REQUEST, 0, &body).unwrap().freeze();
    harness.connector().push_notification(frame);
    tokio::time::sleep(Duration::from_millis(50)).await;

    {
        let requests = engine.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.as_ref(), b"whoami?");
        assert!(requests[0].1.is_some());
    }

    // The engine's answer travels back as a hop response frame.
    let expected = encode_hop_response(0x77, 0, b"ack:7");
    let frames = harness.device.frames_received();
    assert!(
        frames[before..].iter().any(|(_, payload)| payload == &expected),
        "hop reply never reached the device"
    );
}
