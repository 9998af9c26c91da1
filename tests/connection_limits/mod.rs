use std::sync::Arc;

use fanout_sync::ClientExit;
use fanout_sync::CloseReason;
use fanout_sync::SyncClient;
use fanout_sync::SyncStatus;

use crate::common::client_for;
use crate::common::eventually;
use crate::common::proxy_config;
use crate::common::start_proxy;
use crate::common::stop_proxy;
use crate::common::wait_for_subscribers;
use crate::common::ClientSession;
use crate::common::Recorder;

#[tokio::test]
async fn connections_over_the_limit_are_refused() {
    let mut config = proxy_config();
    config.server.max_conns = 2;
    let (proxy, backend) = start_proxy(config).await;
    backend.status(SyncStatus::InSync).await;

    let sessions: Vec<ClientSession> = (0..2)
        .map(|_| {
            let recorder = Arc::new(Recorder::default());
            ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder)
        })
        .collect();
    wait_for_subscribers(&proxy, 2).await;

    let mut refused = client_for(&proxy, Arc::new(Recorder::default()));
    let exit = refused.run(Default::default()).await.unwrap();
    assert_eq!(exit, ClientExit::ServerClosed(CloseReason::TooManyConnections));
    assert_eq!(refused.last_revision(), None);
    assert_eq!(proxy.server.num_connections(), 2);

    for session in sessions {
        assert_eq!(session.stop().await.1, ClientExit::Cancelled);
    }
    stop_proxy(proxy).await;
}

#[tokio::test]
async fn silent_client_is_dropped_and_frees_its_slot() {
    let mut config = proxy_config();
    config.server.max_conns = 1;
    let (proxy, backend) = start_proxy(config).await;
    backend.status(SyncStatus::InSync).await;

    let recorder = Arc::new(Recorder::default());
    let silent = SyncClient::builder(proxy.local_addr.to_string())
        .respond_to_pings(false)
        .build(recorder.clone());
    let silent = ClientSession::spawn(silent, recorder);
    wait_for_subscribers(&proxy, 1).await;

    let mut refused = client_for(&proxy, Arc::new(Recorder::default()));
    assert_eq!(
        refused.run(Default::default()).await.unwrap(),
        ClientExit::ServerClosed(CloseReason::TooManyConnections)
    );

    let (_, exit) = silent.finish().await;
    assert_eq!(exit, ClientExit::ServerClosed(CloseReason::PongTimeout));

    let server = proxy.server.clone();
    eventually("slot to free up", || {
        let server = server.clone();
        async move { server.num_connections() == 0 }
    })
    .await;

    let recorder = Arc::new(Recorder::default());
    let replacement = ClientSession::spawn(client_for(&proxy, recorder.clone()), recorder.clone());
    eventually("replacement to connect", || {
        let server = server.clone();
        async move { server.num_connections() == 1 }
    })
    .await;
    assert!(!replacement.handle.is_finished());
    assert_eq!(replacement.stop().await.1, ClientExit::Cancelled);

    stop_proxy(proxy).await;
}
