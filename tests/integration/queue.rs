//! Queue semantics: FIFO draining, execute merging, label dedup and the
//! fail-fast path when no connector is assigned.

use bytes::Bytes;
use lantern_core::wire::FRAME_EXECUTE;
use lantern_runtime::RuntimeError;

use crate::support::SimHarness;

fn execute_payloads(harness: &SimHarness) -> Vec<Vec<u8>> {
    harness
        .device
        .frames_received()
        .into_iter()
        .filter(|(header, _)| header.frame_type == FRAME_EXECUTE)
        .map(|(_, payload)| payload.to_vec())
        .collect()
}

#[tokio::test]
async fn queued_small_executes_merge_into_one_write() {
    let harness = SimHarness::new();
    harness.connect().await;

    // Spawned tasks all enqueue before the drain task gets to run, so the
    // whole batch is queued at once.
    let mut handles = Vec::new();
    for i in 0..11u8 {
        let runtime = harness.runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.execute(Bytes::from(vec![i; 8]), None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let frames = execute_payloads(&harness);
    assert_eq!(frames.len(), 1, "adjacent small executes should coalesce");
    let mut expected = Vec::new();
    for i in 0..11u8 {
        expected.extend_from_slice(&[i; 8]);
    }
    assert_eq!(frames[0], expected, "merge must preserve enqueue order");
}

#[tokio::test]
async fn merging_never_exceeds_the_chunk_size() {
    let harness = SimHarness::new();
    harness.connect().await;
    let chunk_size = harness.runtime.config().link.chunk_size;
    assert_eq!(chunk_size, 512);

    let mut handles = Vec::new();
    for i in 0..5u8 {
        let runtime = harness.runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.execute(Bytes::from(vec![i; 200]), None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let sizes: Vec<usize> = execute_payloads(&harness).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![400, 400, 200]);
    assert!(sizes.iter().all(|&s| s <= chunk_size));
}

#[tokio::test]
async fn newer_labeled_execute_displaces_the_queued_one() {
    let harness = SimHarness::new();
    harness.connect().await;

    let old = {
        let runtime = harness.runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(Bytes::from_static(b"old scene"), Some("scene".into()))
                .await
        })
    };
    let new = {
        let runtime = harness.runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(Bytes::from_static(b"new scene"), Some("scene".into()))
                .await
        })
    };

    // The displaced command still resolves successfully.
    old.await.unwrap().unwrap();
    new.await.unwrap().unwrap();

    let frames = execute_payloads(&harness);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], b"new scene");
}

#[tokio::test]
async fn unassigned_connector_fails_the_whole_queue() {
    let harness = SimHarness::new();
    harness.runtime.set_connector(None);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let runtime = harness.runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.execute(Bytes::from_static(b"unreachable"), None).await
        }));
    }
    let clock = {
        let runtime = harness.runtime.clone();
        tokio::spawn(async move { runtime.read_clock().await })
    };

    for handle in handles {
        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            RuntimeError::ConnectorNotAssigned
        );
    }
    assert_eq!(
        clock.await.unwrap().unwrap_err(),
        RuntimeError::ConnectorNotAssigned
    );
    assert_eq!(harness.device.frame_count(), 0);
}

#[tokio::test]
async fn distinct_labels_do_not_displace_each_other() {
    let harness = SimHarness::new();
    harness.connect().await;

    let a = {
        let runtime = harness.runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(Bytes::from_static(b"scene-a"), Some("a".into()))
                .await
        })
    };
    let b = {
        let runtime = harness.runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(Bytes::from_static(b"scene-b"), Some("b".into()))
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let total: usize = execute_payloads(&harness).iter().map(Vec::len).sum();
    assert_eq!(total, b"scene-a".len() + b"scene-b".len());
}
