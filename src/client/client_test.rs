use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_utils::del;
use crate::test_utils::enable_logger;
use crate::test_utils::put;
use crate::test_utils::RecordingSink;
use crate::ClientMessage;
use crate::CloseReason;
use crate::Error;
use crate::FrameCodec;
use crate::PipelineEvent;
use crate::ServerMessage;
use crate::SyncStatus;
use crate::Update;

type FakeServer = Framed<TcpStream, FrameCodec<ClientMessage, ServerMessage>>;

async fn listen() -> (TcpListener, String) {
    enable_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> (FakeServer, ClientMessage) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut server = Framed::new(stream, FrameCodec::new(1 << 20));
    let hello = server.next().await.unwrap().unwrap();
    (server, hello)
}

async fn next_from_client(server: &mut FakeServer) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(5), server.next())
        .await
        .expect("client silent")
        .expect("client gone")
        .expect("decode failed")
}

async fn send_snapshot(
    server: &mut FakeServer,
    revision: u64,
    entries: Vec<(&str, &str)>,
) {
    let entries: Vec<(String, Bytes)> = entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), Bytes::from(v.to_string())))
        .collect();
    server
        .send(ServerMessage::SnapshotBegin {
            revision,
            status: SyncStatus::InSync,
            total_entries: entries.len() as u64,
        })
        .await
        .unwrap();
    server.send(ServerMessage::SnapshotChunk { entries }).await.unwrap();
    server.send(ServerMessage::SnapshotEnd { revision }).await.unwrap();
}

fn server_hello() -> ServerMessage {
    ServerMessage::Hello {
        version: 1,
        server_id: "fake".into(),
    }
}

#[tokio::test]
async fn applies_snapshot_and_deltas_then_acks() {
    let (listener, addr) = listen().await;
    let sink = Arc::new(RecordingSink::default());
    let mut client = SyncClient::builder(addr).hostname("h1").build(sink.clone());

    let server = tokio::spawn(async move {
        let (mut server, hello) = accept(&listener).await;
        let ClientMessage::Hello(hello) = hello else {
            panic!("expected hello");
        };
        assert_eq!(hello.hostname, "h1");
        assert_eq!(hello.resume_from, None);

        server.send(server_hello()).await.unwrap();
        send_snapshot(&mut server, 3, vec![("/a", "1"), ("/b", "2")]).await;
        assert_eq!(next_from_client(&mut server).await, ClientMessage::Ack { revision: 3 });

        server
            .send(ServerMessage::Deltas {
                updates: vec![del("/a", 4), put("/c", "3", 5)],
                revision: 5,
            })
            .await
            .unwrap();
        assert_eq!(next_from_client(&mut server).await, ClientMessage::Ack { revision: 5 });

        server.send(ServerMessage::Ping { timestamp_ms: 77 }).await.unwrap();
        assert_eq!(
            next_from_client(&mut server).await,
            ClientMessage::Pong { ping_timestamp_ms: 77 }
        );

        server
            .send(ServerMessage::Close {
                reason: CloseReason::ServerShutdown,
            })
            .await
            .unwrap();
    });

    let exit = client.run(CancellationToken::new()).await.unwrap();
    server.await.unwrap();

    assert_eq!(exit, ClientExit::ServerClosed(CloseReason::ServerShutdown));
    assert_eq!(client.last_revision(), Some(5));
    assert_eq!(client.status(), SyncStatus::InSync);
    assert_eq!(client.server_id(), Some("fake"));
    assert_eq!(
        client.state().keys().cloned().collect::<Vec<_>>(),
        vec!["/b".to_string(), "/c".to_string()]
    );

    let events = sink.events();
    assert!(matches!(events[0], PipelineEvent::Status(SyncStatus::InSync)));
    assert_eq!(sink.updates().len(), 4);
}

#[tokio::test]
async fn resnapshot_reports_removed_keys_as_tombstones() {
    let (listener, addr) = listen().await;
    let sink = Arc::new(RecordingSink::default());
    let mut client = SyncClient::builder(addr).build(sink.clone());

    let server = tokio::spawn(async move {
        let (mut first, _) = accept(&listener).await;
        first.send(server_hello()).await.unwrap();
        send_snapshot(&mut first, 2, vec![("/a", "1"), ("/b", "2")]).await;
        next_from_client(&mut first).await;
        drop(first);

        let (mut second, hello) = accept(&listener).await;
        let ClientMessage::Hello(hello) = hello else {
            panic!("expected hello");
        };
        assert_eq!(hello.resume_from, Some(2));
        second.send(server_hello()).await.unwrap();
        send_snapshot(&mut second, 9, vec![("/b", "2"), ("/c", "3")]).await;
        next_from_client(&mut second).await;
        second
            .send(ServerMessage::Close {
                reason: CloseReason::Rebalance,
            })
            .await
            .unwrap();
    });

    assert_eq!(client.run(CancellationToken::new()).await.unwrap(), ClientExit::Disconnected);
    assert_eq!(
        client.run(CancellationToken::new()).await.unwrap(),
        ClientExit::ServerClosed(CloseReason::Rebalance)
    );
    server.await.unwrap();

    let updates = sink.updates();
    assert_eq!(&updates[2..], &[Update::delete("/a", 9), Update::put("/c", "3", 9)]);
    assert_eq!(client.last_revision(), Some(9));
}

#[tokio::test]
async fn refused_session_reports_reason() {
    let (listener, addr) = listen().await;
    let mut client = SyncClient::builder(addr).build(Arc::new(RecordingSink::default()));

    let server = tokio::spawn(async move {
        let (mut server, _) = accept(&listener).await;
        server
            .send(ServerMessage::Close {
                reason: CloseReason::TooManyConnections,
            })
            .await
            .unwrap();
    });

    assert_eq!(
        client.run(CancellationToken::new()).await.unwrap(),
        ClientExit::ServerClosed(CloseReason::TooManyConnections)
    );
    server.await.unwrap();
}

#[tokio::test]
async fn cancel_says_goodbye() {
    let (listener, addr) = listen().await;
    let mut client = SyncClient::builder(addr).build(Arc::new(RecordingSink::default()));
    let cancel = CancellationToken::new();

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let (mut server, _) = accept(&listener).await;
        server.send(server_hello()).await.unwrap();
        server_cancel.cancel();
        assert_eq!(next_from_client(&mut server).await, ClientMessage::Goodbye);
    });

    assert_eq!(client.run(cancel).await.unwrap(), ClientExit::Cancelled);
    server.await.unwrap();
}

#[tokio::test]
async fn chunk_without_snapshot_is_a_protocol_error() {
    let (listener, addr) = listen().await;
    let mut client = SyncClient::builder(addr).build(Arc::new(RecordingSink::default()));

    let server = tokio::spawn(async move {
        let (mut server, _) = accept(&listener).await;
        server.send(server_hello()).await.unwrap();
        server
            .send(ServerMessage::SnapshotChunk { entries: vec![] })
            .await
            .unwrap();
        server
    });

    let result = client.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Connection(_))));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn silent_server_times_out_handshake() {
    let (listener, addr) = listen().await;
    let mut client = SyncClient::builder(addr)
        .handshake_timeout(Duration::from_millis(200))
        .build(Arc::new(RecordingSink::default()));

    let server = tokio::spawn(async move {
        let accepted = accept(&listener).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(accepted);
    });

    let result = client.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Connection(_))));
    server.abort();
}
