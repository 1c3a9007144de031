//! End-to-end WebSocket tests: real server, real clients, full relay
//! pipeline.

use std::sync::Arc;

use atlas_collab::engine::SyncEngine;
use atlas_collab::server::{ServerConfig, SyncServer};
use atlas_collab::storage::{MemorySnapshotStore, SnapshotStore};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, StateVector, Text, Update, WriteTxn};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    engine: Arc<SyncEngine>,
    store: Arc<MemorySnapshotStore>,
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_with(mut config: ServerConfig) -> TestServer {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let store = Arc::new(MemorySnapshotStore::new());
    let server = SyncServer::with_snapshot_store(config, store.clone());
    let engine = server.engine();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listener time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        port,
        engine,
        store,
    }
}

async fn start_test_server() -> TestServer {
    start_server_with(ServerConfig {
        max_peers_per_room: 10,
        outbound_buffer: 64,
        flush_debounce_ms: 20,
        idle_grace_secs: 300,
        ..ServerConfig::default()
    })
    .await
}

async fn connect(port: u16, doc: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/sync/{doc}"))
        .await
        .expect("connect");
    ws
}

/// Read the next binary frame, skipping transport frames, within 2s.
async fn recv_binary(ws: &mut WsClient) -> Option<Vec<u8>> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return Some(data.into()),
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return None,
        }
    }
}

/// Assert that no binary frame arrives within `ms` milliseconds.
async fn assert_silent(ws: &mut WsClient, ms: u64) {
    match timeout(Duration::from_millis(ms), ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => {
            let data: Vec<u8> = data.into();
            panic!("expected silence, received {} bytes", data.len());
        }
        _ => {}
    }
}

fn note_update(content: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        let text = txn.get_or_insert_text("notes");
        text.insert(&mut txn, 0, content);
    }
    let txn = yrs::Transact::transact(&doc);
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn decode_notes(state: &[u8]) -> String {
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let txn = yrs::Transact::transact(&doc);
    match txn.get_text("notes") {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

#[tokio::test]
async fn test_join_receives_initial_state() {
    let server = start_test_server().await;
    let mut ws = connect(server.port, "m-join").await;

    let initial = recv_binary(&mut ws).await.expect("initial sync frame");
    // A brand-new document syncs as a valid, empty update.
    assert_eq!(decode_notes(&initial), "");
}

#[tokio::test]
async fn test_handshake_rejected_without_doc_id() {
    let server = start_test_server().await;
    let result =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/", server.port)).await;
    assert!(result.is_err(), "handshake must fail without a document id");
}

#[tokio::test]
async fn test_exclusive_broadcast_three_peers() {
    let server = start_test_server().await;
    let mut a = connect(server.port, "m-fan").await;
    let mut b = connect(server.port, "m-fan").await;
    let mut c = connect(server.port, "m-fan").await;

    recv_binary(&mut a).await.unwrap();
    recv_binary(&mut b).await.unwrap();
    recv_binary(&mut c).await.unwrap();

    let update = note_update("from A");
    a.send(Message::Binary(update.clone().into())).await.unwrap();

    assert_eq!(recv_binary(&mut b).await.unwrap(), update);
    assert_eq!(recv_binary(&mut c).await.unwrap(), update);
    assert_silent(&mut a, 300).await;
}

#[tokio::test]
async fn test_join_then_sync_includes_prior_updates() {
    let server = start_test_server().await;
    let mut a = connect(server.port, "m-catchup").await;
    recv_binary(&mut a).await.unwrap();

    a.send(Message::Binary(note_update("first ").into())).await.unwrap();
    a.send(Message::Binary(note_update("second ").into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = connect(server.port, "m-catchup").await;
    let initial = recv_binary(&mut b).await.expect("initial sync");
    let text = decode_notes(&initial);
    assert!(text.contains("first"), "missing first update: {text:?}");
    assert!(text.contains("second"), "missing second update: {text:?}");
}

#[tokio::test]
async fn test_malformed_update_resilience() {
    let server = start_test_server().await;
    let mut a = connect(server.port, "m-garbage").await;
    let mut b = connect(server.port, "m-garbage").await;
    recv_binary(&mut a).await.unwrap();
    recv_binary(&mut b).await.unwrap();

    // Garbage is dropped: nothing reaches B and A stays connected.
    a.send(Message::Binary(vec![0xFF, 0x00, 0x13, 0x37].into()))
        .await
        .unwrap();
    assert_silent(&mut b, 300).await;

    let update = note_update("recovered");
    a.send(Message::Binary(update.clone().into())).await.unwrap();
    assert_eq!(recv_binary(&mut b).await.unwrap(), update);
}

#[tokio::test]
async fn test_transport_ping_pong() {
    let server = start_test_server().await;
    let mut ws = connect(server.port, "m-ping").await;
    recv_binary(&mut ws).await.unwrap();

    ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
    let got_pong = loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Pong(payload)))) => {
                let payload: Vec<u8> = payload.into();
                break payload == vec![1, 2, 3];
            }
            Ok(Some(Ok(_))) => continue,
            _ => break false,
        }
    };
    assert!(got_pong, "server must answer transport pings");
}

#[tokio::test]
async fn test_disconnect_flushes_dirty_state() {
    let server = start_test_server().await;
    let mut ws = connect(server.port, "m-flush").await;
    recv_binary(&mut ws).await.unwrap();

    ws.send(Message::Binary(note_update("persist me").into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = server
        .store
        .load("m-flush")
        .await
        .unwrap()
        .expect("snapshot flushed on last disconnect");
    assert_eq!(decode_notes(&stored), "persist me");
}

#[tokio::test]
async fn test_room_cap_closes_excess_peer() {
    let server = start_server_with(ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    })
    .await;

    let mut a = connect(server.port, "m-cap").await;
    recv_binary(&mut a).await.unwrap();

    // The second peer handshakes fine but is closed before any sync.
    let mut b = connect(server.port, "m-cap").await;
    assert_eq!(recv_binary(&mut b).await, None);
}

/// The end-to-end scenario: join, relay, catch-up, delete.
#[tokio::test]
async fn test_concrete_scenario_m1() {
    let server = start_test_server().await;

    // Peer A joins and seeds the document with U1.
    let mut a = connect(server.port, "m1").await;
    recv_binary(&mut a).await.expect("A initial sync");
    let u1 = note_update("U1 ");
    a.send(Message::Binary(u1.into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Peer B joins and must see U1's effect in its initial sync.
    let mut b = connect(server.port, "m1").await;
    let b_initial = recv_binary(&mut b).await.expect("B initial sync");
    assert!(decode_notes(&b_initial).contains("U1"));

    // B sends U2; A receives exactly U2 (never U1, never its own send).
    let u2 = note_update("U2 ");
    b.send(Message::Binary(u2.clone().into())).await.unwrap();
    assert_eq!(recv_binary(&mut a).await.unwrap(), u2);
    assert_silent(&mut a, 200).await;

    // Deletion closes both peers and removes the durable snapshot.
    assert!(server.engine.delete_document("m1").await);

    let a_closed = matches!(
        timeout(Duration::from_secs(2), a.next()).await,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_)))
    );
    let b_closed = matches!(
        timeout(Duration::from_secs(2), b.next()).await,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_)))
    );
    assert!(a_closed, "A must be closed by deletion");
    assert!(b_closed, "B must be closed by deletion");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.store.load("m1").await.unwrap(), None);

    // Deleting again reports that nothing existed.
    assert!(!server.engine.delete_document("m1").await);
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let server = start_test_server().await;
    let mut a = connect(server.port, "m-iso-1").await;
    let mut b = connect(server.port, "m-iso-2").await;
    recv_binary(&mut a).await.unwrap();
    recv_binary(&mut b).await.unwrap();

    a.send(Message::Binary(note_update("only for room 1").into()))
        .await
        .unwrap();
    assert_silent(&mut b, 300).await;
}
