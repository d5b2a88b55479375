//! End-to-end relay tests over real WebSocket connections.
//!
//! Each test binds an ephemeral port, so tests run in parallel without
//! interference.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use syncroom_protocol::{Frame, PresenceDelta, Replica, UpdateOrigin, YDocument};
use syncroom_relay::persist::MemoryStore;
use syncroom_relay::registry::RoomRegistry;
use syncroom_relay::ws;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SAVE_DEBOUNCE: Duration = Duration::from_millis(50);

async fn start_relay(store: Arc<MemoryStore>) -> SocketAddr {
    start_relay_with(store, Duration::from_secs(30)).await.0
}

async fn start_relay_with(
    store: Arc<MemoryStore>,
    ping_interval: Duration,
) -> (SocketAddr, Arc<RoomRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = RoomRegistry::new(store, SAVE_DEBOUNCE);
    let serve_registry = registry.clone();
    tokio::spawn(async move {
        let _ = ws::serve(listener, serve_registry, ping_interval, Duration::from_secs(30)).await;
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr, room: &str) -> Ws {
    let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/{room}"))
        .await
        .unwrap();
    // Give the server a moment to finish attaching the session
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws
}

async fn recv_binary(ws: &mut Ws) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(bytes) = msg {
            return bytes;
        }
    }
}

/// Assert no binary frame arrives for a while; control frames are ignored.
async fn expect_silence(ws: &mut Ws) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Binary(bytes)))) => {
                panic!("expected no frame, got {} bytes", bytes.len());
            }
            Ok(_) => {}
        }
    }
}

fn make_update(content: &str) -> Vec<u8> {
    let mut doc = YDocument::new();
    let text = doc.text("content");
    doc.edit(|txn| {
        use yrs::Text;
        text.insert(txn, 0, content);
    })
}

fn doc_content(update: &[u8]) -> String {
    use yrs::GetString;
    let mut doc = YDocument::new();
    doc.apply_update(update, UpdateOrigin::Remote).unwrap();
    let text = doc.text("content");
    let txn = doc.transact();
    text.get_string(&txn)
}

#[tokio::test]
async fn update_reaches_other_sessions_in_room() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let mut bob = connect(addr, "doc1").await;

    let update = make_update("hello");
    alice
        .send(Message::Binary(Frame::Doc(update).encode()))
        .await
        .unwrap();

    let frame = recv_binary(&mut bob).await;
    let Frame::Doc(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected doc frame");
    };
    assert_eq!(doc_content(&payload), "hello");
}

#[tokio::test]
async fn late_joiner_gets_full_state_first() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;

    alice
        .send(Message::Binary(Frame::Doc(make_update("early bird")).encode()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = connect(addr, "doc1").await;
    let frame = recv_binary(&mut bob).await;
    let Frame::Doc(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected doc frame");
    };
    assert_eq!(doc_content(&payload), "early bird");
}

#[tokio::test]
async fn empty_room_sends_no_initial_state() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    expect_silence(&mut alice).await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "room-a").await;
    let mut bob = connect(addr, "room-b").await;

    alice
        .send(Message::Binary(Frame::Doc(make_update("private")).encode()))
        .await
        .unwrap();

    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn sender_does_not_get_its_own_update_back() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let _bob = connect(addr, "doc1").await;

    alice
        .send(Message::Binary(Frame::Doc(make_update("mine")).encode()))
        .await
        .unwrap();

    expect_silence(&mut alice).await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_session() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let mut bob = connect(addr, "doc1").await;

    // Unknown kind byte, empty message, truncated doc payload
    alice.send(Message::Binary(vec![9, 9, 9])).await.unwrap();
    alice.send(Message::Binary(vec![])).await.unwrap();
    alice.send(Message::Binary(vec![0, 0xde])).await.unwrap();

    // The session survives and later valid traffic still relays
    alice
        .send(Message::Binary(Frame::Doc(make_update("still here")).encode()))
        .await
        .unwrap();

    let frame = recv_binary(&mut bob).await;
    let Frame::Doc(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected doc frame");
    };
    assert_eq!(doc_content(&payload), "still here");
}

#[tokio::test]
async fn presence_publish_reaches_peers_and_replays_to_late_joiners() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let mut bob = connect(addr, "doc1").await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("name".to_string(), serde_json::json!("alice"));
    let publish = PresenceDelta::Publish { client: 42, fields };
    alice
        .send(Message::Binary(Frame::Presence(publish.encode()).encode()))
        .await
        .unwrap();

    let frame = recv_binary(&mut bob).await;
    let Frame::Presence(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected presence frame");
    };
    assert_eq!(PresenceDelta::decode(&payload).unwrap().client(), 42);

    // A later joiner sees the current presence without anyone republishing
    let mut carol = connect(addr, "doc1").await;
    let frame = recv_binary(&mut carol).await;
    let Frame::Presence(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected presence replay");
    };
    let PresenceDelta::Publish { client, fields } = PresenceDelta::decode(&payload).unwrap() else {
        panic!("expected publish");
    };
    assert_eq!(client, 42);
    assert_eq!(fields.get("name"), Some(&serde_json::json!("alice")));
}

#[tokio::test]
async fn disconnect_broadcasts_presence_leave() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let mut bob = connect(addr, "doc1").await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("name".to_string(), serde_json::json!("alice"));
    alice
        .send(Message::Binary(
            Frame::Presence(PresenceDelta::Publish { client: 7, fields }.encode()).encode(),
        ))
        .await
        .unwrap();
    // Bob sees the publish first
    let _ = recv_binary(&mut bob).await;

    alice.close(None).await.unwrap();

    let frame = recv_binary(&mut bob).await;
    let Frame::Presence(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected presence frame");
    };
    let PresenceDelta::Leave { client } = PresenceDelta::decode(&payload).unwrap() else {
        panic!("expected leave");
    };
    assert_eq!(client, 7);
}

#[tokio::test]
async fn unresponsive_session_is_terminated_and_its_presence_expired() {
    let (addr, registry) =
        start_relay_with(Arc::new(MemoryStore::new()), Duration::from_millis(200)).await;
    let mut observer = connect(addr, "doc1").await;
    let mut zombie = connect(addr, "doc1").await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("name".to_string(), serde_json::json!("zombie"));
    zombie
        .send(Message::Binary(
            Frame::Presence(PresenceDelta::Publish { client: 5, fields }.encode()).encode(),
        ))
        .await
        .unwrap();
    let _ = recv_binary(&mut observer).await;

    // The zombie stops reading from here on, so the server's pings are
    // never answered and the session must be forcibly terminated

    let frame = recv_binary(&mut observer).await;
    let Frame::Presence(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected presence frame");
    };
    let PresenceDelta::Leave { client } = PresenceDelta::decode(&payload).unwrap() else {
        panic!("expected leave");
    };
    assert_eq!(client, 5);

    let room = registry.get_or_create("doc1").await;
    assert_eq!(room.session_count(), 1);
    assert_eq!(room.presence_count(), 0);
}

#[tokio::test]
async fn disconnect_expires_every_client_the_session_published() {
    let addr = start_relay(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(addr, "doc1").await;
    let mut bob = connect(addr, "doc1").await;

    // One connection publishing under two client ids
    for client in [5u64, 6] {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("name".to_string(), serde_json::json!(format!("c{client}")));
        alice
            .send(Message::Binary(
                Frame::Presence(PresenceDelta::Publish { client, fields }.encode()).encode(),
            ))
            .await
            .unwrap();
        let _ = recv_binary(&mut bob).await;
    }

    alice.close(None).await.unwrap();

    let mut gone = std::collections::HashSet::new();
    for _ in 0..2 {
        let frame = recv_binary(&mut bob).await;
        let Frame::Presence(payload) = Frame::decode(&frame).unwrap() else {
            panic!("expected presence frame");
        };
        let PresenceDelta::Leave { client } = PresenceDelta::decode(&payload).unwrap() else {
            panic!("expected leave");
        };
        gone.insert(client);
    }
    assert_eq!(gone, std::collections::HashSet::from([5u64, 6]));
}

#[tokio::test]
async fn snapshots_survive_a_relay_restart() {
    let store = Arc::new(MemoryStore::new());

    let addr = start_relay(store.clone()).await;
    let mut alice = connect(addr, "doc1").await;
    alice
        .send(Message::Binary(Frame::Doc(make_update("durable")).encode()))
        .await
        .unwrap();
    // Wait out the debounce window so the snapshot lands in the store
    tokio::time::sleep(SAVE_DEBOUNCE * 4).await;
    alice.close(None).await.unwrap();

    // A fresh relay over the same store: the room comes back hydrated
    let addr = start_relay(store).await;
    let mut bob = connect(addr, "doc1").await;
    // The load is async, so the state may arrive as the initial sync or as
    // a broadcast shortly after
    let frame = recv_binary(&mut bob).await;
    let Frame::Doc(payload) = Frame::decode(&frame).unwrap() else {
        panic!("expected doc frame");
    };
    assert_eq!(doc_content(&payload), "durable");
}
