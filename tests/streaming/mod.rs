use std::sync::Arc;
use std::time::Duration;

use fanout_sync::ClientExit;
use fanout_sync::CloseReason;
use fanout_sync::SyncClient;
use fanout_sync::SyncStatus;
use fanout_sync::Update;

use crate::common::client_for;
use crate::common::proxy_config;
use crate::common::put;
use crate::common::start_proxy;
use crate::common::stop_proxy;
use crate::common::wait_for_revision;
use crate::common::wait_for_subscribers;
use crate::common::ClientSession;
use crate::common::Recorder;

#[tokio::test]
async fn live_updates_arrive_as_one_batch() {
    let (proxy, backend) = start_proxy(proxy_config()).await;
    backend.status(SyncStatus::InSync).await;

    let recorder = Arc::new(Recorder::default());
    let session = ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder.clone());
    wait_for_subscribers(&proxy, 1).await;

    backend
        .updates(vec![put("/a", "1", 1), put("/b", "2", 2), put("/a", "3", 3)])
        .await;
    recorder.wait_until(|updates| updates.len() == 3).await;

    assert_eq!(
        recorder.update_batches(),
        vec![vec![put("/a", "1", 1), put("/b", "2", 2), put("/a", "3", 3)]]
    );

    let (client, exit) = session.stop().await;
    assert_eq!(exit, ClientExit::Cancelled);
    assert_eq!(client.last_revision(), Some(3));
    assert_eq!(client.status(), SyncStatus::InSync);
    assert_eq!(client.state().get("/a").map(|v| v.as_ref()), Some(&b"3"[..]));
    assert_eq!(client.state().get("/b").map(|v| v.as_ref()), Some(&b"2"[..]));

    stop_proxy(proxy).await;
}

#[tokio::test]
async fn late_client_starts_from_snapshot() {
    let (proxy, backend) = start_proxy(proxy_config()).await;
    backend.status(SyncStatus::InSync).await;
    backend
        .updates(vec![put("/a", "1", 1), put("/b", "2", 2), put("/a", "3", 3)])
        .await;
    wait_for_revision(&proxy, 3).await;

    let recorder = Arc::new(Recorder::default());
    let session = ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder.clone());
    recorder.wait_until(|updates| updates.len() == 2).await;

    // the snapshot is reported at its own revision
    assert_eq!(recorder.updates(), vec![put("/a", "3", 3), put("/b", "2", 3)]);

    let (client, _) = session.stop().await;
    assert_eq!(client.last_revision(), Some(3));

    stop_proxy(proxy).await;
}

#[tokio::test]
async fn reconnecting_client_gets_only_missed_updates() {
    let (proxy, backend) = start_proxy(proxy_config()).await;
    backend.status(SyncStatus::InSync).await;
    backend.updates(vec![put("/a", "1", 1), put("/b", "2", 2)]).await;
    wait_for_revision(&proxy, 2).await;

    let recorder = Arc::new(Recorder::default());
    let session = ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder.clone());
    recorder.wait_until(|updates| updates.len() == 2).await;
    let (client, exit) = session.stop().await;
    assert_eq!(exit, ClientExit::Cancelled);
    assert_eq!(client.last_revision(), Some(2));

    backend
        .updates(vec![put("/c", "3", 3), Update::delete("/a", 4)])
        .await;
    wait_for_revision(&proxy, 4).await;

    let session = ClientSession::spawn(client, recorder.clone());
    recorder.wait_until(|updates| updates.len() == 4).await;

    assert_eq!(
        &recorder.updates()[2..],
        &[put("/c", "3", 3), Update::delete("/a", 4)]
    );
    let (client, _) = session.stop().await;
    assert_eq!(client.last_revision(), Some(4));
    assert_eq!(
        client.state().keys().cloned().collect::<Vec<_>>(),
        vec!["/b".to_string(), "/c".to_string()]
    );

    stop_proxy(proxy).await;
}

#[tokio::test]
async fn large_batches_are_split_by_message_size() {
    let mut config = proxy_config();
    config.server.max_message_size = 10;
    let (proxy, backend) = start_proxy(config).await;
    backend.status(SyncStatus::InSync).await;

    let recorder = Arc::new(Recorder::default());
    let session = ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder.clone());
    wait_for_subscribers(&proxy, 1).await;

    let updates: Vec<Update> = (1..=35).map(|i| put(&format!("/k{:02}", i), "1", i)).collect();
    backend.updates(updates.clone()).await;
    recorder.wait_until(|received| received.len() == 35).await;

    let batches = recorder.update_batches();
    assert!(batches.len() >= 4);
    assert!(batches.iter().all(|batch| batch.len() <= 10));
    assert_eq!(recorder.updates(), updates);

    let (client, _) = session.stop().await;
    assert_eq!(client.state().len(), 35);

    stop_proxy(proxy).await;
}

#[tokio::test]
async fn client_that_never_acks_is_dropped_without_stalling_others() {
    let (proxy, backend) = start_proxy(proxy_config()).await;
    backend.status(SyncStatus::InSync).await;

    let fast_recorder = Arc::new(Recorder::default());
    let fast = ClientSession::spawn(client_for(&proxy, fast_recorder.clone()), fast_recorder.clone());
    let slow_recorder = Arc::new(Recorder::default());
    let slow_client = SyncClient::builder(proxy.local_addr.to_string())
        .send_acks(false)
        .build(slow_recorder.clone());
    let slow = ClientSession::spawn(slow_client, slow_recorder);
    wait_for_subscribers(&proxy, 2).await;

    let mut revision = 0;
    while !slow.handle.is_finished() && revision < 100 {
        revision += 1;
        backend.updates(vec![put("/tick", &revision.to_string(), revision)]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (_, exit) = slow.finish().await;
    assert_eq!(exit, ClientExit::ServerClosed(CloseReason::FellBehind));

    revision += 1;
    backend.updates(vec![put("/after", "1", revision)]).await;
    fast_recorder
        .wait_until(|updates| updates.iter().any(|u| u.key == "/after"))
        .await;

    let (client, exit) = fast.stop().await;
    assert_eq!(exit, ClientExit::Cancelled);
    assert_eq!(client.last_revision(), Some(revision));

    stop_proxy(proxy).await;
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let (proxy, backend) = start_proxy(proxy_config()).await;
    backend.status(SyncStatus::InSync).await;

    let sessions: Vec<ClientSession> = (0..3)
        .map(|_| {
            let recorder = Arc::new(Recorder::default());
            ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder)
        })
        .collect();
    wait_for_subscribers(&proxy, 3).await;

    stop_proxy(proxy).await;

    for session in sessions {
        let (_, exit) = session.finish().await;
        assert_eq!(exit, ClientExit::ServerClosed(CloseReason::ServerShutdown));
    }
}
