use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_utils::put;
use crate::test_utils::RecordingSink;
use crate::Error;
use crate::PipelineError;

#[tokio::test]
async fn events_are_delivered_in_arrival_order() {
    let decoupler = SyncerCallbacksDecoupler::new("test", 4);
    let sender = decoupler.sender();
    let sink = Arc::new(RecordingSink::default());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(decoupler.send_to(sink.clone(), cancel.clone()));

    sender.on_status_updated(SyncStatus::ResyncInProgress).await.unwrap();
    for rev in 1..=10 {
        sender.on_updates(vec![put("/k", &format!("{rev}"), rev)]).await.unwrap();
    }
    sender.on_status_updated(SyncStatus::InSync).await.unwrap();
    drop(sender);

    handle.await.unwrap().unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 12);
    assert_eq!(events[0], PipelineEvent::Status(SyncStatus::ResyncInProgress));
    assert_eq!(events[11], PipelineEvent::Status(SyncStatus::InSync));
    let revisions: Vec<u64> = sink.updates().iter().map(|u| u.revision).collect();
    assert_eq!(revisions, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn empty_update_batches_are_not_queued() {
    let decoupler = SyncerCallbacksDecoupler::new("test", 1);
    let sender = decoupler.sender();

    // would block forever on a full queue if empty batches were enqueued
    for _ in 0..5 {
        tokio::time::timeout(Duration::from_millis(100), sender.on_updates(vec![]))
            .await
            .expect("empty batch must not block")
            .unwrap();
    }
}

#[tokio::test]
async fn full_queue_applies_backpressure_to_producer() {
    let decoupler = SyncerCallbacksDecoupler::new("test", 1);
    let sender = decoupler.sender();

    sender.on_updates(vec![put("/a", "1", 1)]).await.unwrap();
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        sender.on_updates(vec![put("/b", "2", 2)]),
    )
    .await;
    assert!(blocked.is_err(), "second send should wait for the consumer");

    let sink = Arc::new(RecordingSink::default());
    let cancel = CancellationToken::new();
    tokio::spawn(decoupler.send_to(sink.clone(), cancel.clone()));

    sender.on_updates(vec![put("/b", "2", 2)]).await.unwrap();
    sink.wait_for_events(2).await;
    cancel.cancel();
}

#[tokio::test]
async fn cancelled_decoupler_exits_and_producer_sees_closed_queue() {
    let decoupler = SyncerCallbacksDecoupler::new("test", 4);
    let sender = decoupler.sender();
    let sink = Arc::new(RecordingSink::default());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(decoupler.send_to(sink.clone(), cancel.clone()));
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let result = sender.on_updates(vec![put("/a", "1", 1)]).await;
    assert!(matches!(
        result,
        Err(Error::Pipeline(PipelineError::QueueClosed("test")))
    ));
}

#[tokio::test]
async fn downstream_failure_stops_delivery() {
    let decoupler = SyncerCallbacksDecoupler::new("test", 4);
    let sender = decoupler.sender();

    let mut sink = MockSyncerCallbacks::new();
    sink.expect_on_updates()
        .times(1)
        .returning(|_| Err(PipelineError::CacheStopped.into()));

    sender.on_updates(vec![put("/a", "1", 1)]).await.unwrap();
    sender.on_updates(vec![put("/b", "2", 2)]).await.unwrap();

    let result = decoupler.send_to(Arc::new(sink), CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Pipeline(PipelineError::CacheStopped))));
}
