//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full join / mutate / leave pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use slate_collab::auth::TokenAuth;
use slate_collab::client::{ConnectionState, SyncEvent, WhiteboardClient};
use slate_collab::document::{CanvasObject, ObjectKind, ObjectPatch};
use slate_collab::presence::PALETTE;
use slate_collab::protocol::ServerMessage;
use slate_collab::server::{ServerConfig, SyncServer};
use slate_collab::storage::{DocumentStore, Member, MemoryStore, PermissionLevel};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type RawSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    server: Arc<SyncServer>,
    store: Arc<MemoryStore>,
    auth: TokenAuth,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig {
            max_peers_per_room: 10,
            ..ServerConfig::default()
        })
        .await
    }

    async fn start_with(mut config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        config.bind_addr = addr.to_string();

        let store = Arc::new(MemoryStore::new());
        let auth = TokenAuth::new("integration-secret");
        let server = Arc::new(SyncServer::new(
            config,
            Arc::new(auth.clone()),
            store.clone(),
        ));

        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        Self {
            url: format!("ws://{addr}"),
            server,
            store,
            auth,
        }
    }

    /// Register a member and mint a token for them.
    async fn member(&self, name: &str) -> (Uuid, String) {
        let id = Uuid::new_v4();
        self.store.insert_member(Member::new(id, name)).await;
        (id, self.auth.issue(id).unwrap())
    }

    /// Connect a client and swallow its `Connected` event.
    async fn client(&self, whiteboard_id: Uuid) -> (WhiteboardClient, mpsc::Receiver<SyncEvent>) {
        let mut client = WhiteboardClient::new(whiteboard_id, &self.url);
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
        (client, events)
    }

    async fn raw(&self) -> RawSocket {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .unwrap();
        ws
    }

    async fn wait_for_rooms(&self, expected: usize) {
        for _ in 0..100 {
            if self.server.stats().await.active_rooms == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {expected} active rooms");
    }

    async fn wait_for_connections(&self, expected: u64) {
        for _ in 0..200 {
            if self.server.stats().await.active_connections == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {expected} active connections");
    }
}

async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert nothing arrives for a short while.
async fn assert_quiet(events: &mut mpsc::Receiver<SyncEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

async fn raw_recv(ws: &mut RawSocket) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

async fn raw_send(ws: &mut RawSocket, text: String) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

fn joined_users(event: SyncEvent) -> Vec<slate_collab::presence::Presence> {
    match event {
        SyncEvent::Joined { active_users, .. } => active_users,
        other => panic!("Expected Joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = TestServer::start().await;
    let (client, _events) = server.client(Uuid::new_v4()).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    server.wait_for_connections(1).await;
}

#[tokio::test]
async fn test_owner_and_viewer_session() {
    let server = TestServer::start().await;
    let (alice, alice_token) = server.member("Alice").await;
    let (bob, bob_token) = server.member("Bob").await;
    let wb = server.store.create_whiteboard("Roadmap", alice).await;
    server.store.grant(wb, bob, PermissionLevel::Viewer).await;

    // Owner joins an empty room
    let (client_a, mut events_a) = server.client(wb).await;
    client_a.join(alice_token).await.unwrap();
    match next_event(&mut events_a).await {
        SyncEvent::Joined {
            active_users,
            whiteboard,
        } => {
            assert_eq!(active_users.len(), 1);
            assert_eq!(active_users[0].id, alice);
            assert_eq!(active_users[0].color, PALETTE[0]);
            assert_eq!(whiteboard.id, wb);
            assert_eq!(whiteboard.title, "Roadmap");
            assert_eq!(whiteboard.owner_id, alice);
            assert!(whiteboard.content.is_empty());
        }
        other => panic!("Expected Joined, got {other:?}"),
    }

    // Viewer joins and sees both members
    let (mut client_b, mut events_b) = server.client(wb).await;
    client_b.join(bob_token).await.unwrap();
    let users = joined_users(next_event(&mut events_b).await);
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].id, alice);
    assert_eq!(users[1].id, bob);
    assert_eq!(users[1].color, PALETTE[1]);

    match next_event(&mut events_a).await {
        SyncEvent::PeerJoined(user) => {
            assert_eq!(user.id, bob);
            assert_eq!(user.name, "Bob");
            assert_eq!(user.color, PALETTE[1]);
        }
        other => panic!("Expected PeerJoined, got {other:?}"),
    }
    assert_quiet(&mut events_b).await;

    // Owner creates an object: only the viewer hears about it
    let mut sticky = CanvasObject::new("note-1", ObjectKind::Text, 10.0, 20.0);
    sticky.content = Some("Ship it".into());
    client_a.create_object(sticky.clone()).await.unwrap();

    assert_eq!(
        next_event(&mut events_b).await,
        SyncEvent::ObjectCreated(sticky.clone())
    );
    assert_quiet(&mut events_a).await;

    let stored = server.store.read_document(wb).await.unwrap();
    assert_eq!(stored.content.version, 1);
    assert_eq!(stored.content.get("note-1"), Some(&sticky));

    // Viewer drops off
    client_b.disconnect().await;
    assert_eq!(next_event(&mut events_a).await, SyncEvent::PeerLeft(bob));
    assert_eq!(
        server.server.engine().registry().member_count(wb).await,
        1
    );
}

#[tokio::test]
async fn test_update_and_delete_broadcast() {
    let server = TestServer::start().await;
    let (alice, alice_token) = server.member("Alice").await;
    let (bob, bob_token) = server.member("Bob").await;
    let wb = server.store.create_whiteboard("Sketch", alice).await;
    server.store.grant(wb, bob, PermissionLevel::Editor).await;

    let (client_a, mut events_a) = server.client(wb).await;
    client_a.join(alice_token).await.unwrap();
    joined_users(next_event(&mut events_a).await);

    let (client_b, mut events_b) = server.client(wb).await;
    client_b.join(bob_token).await.unwrap();
    joined_users(next_event(&mut events_b).await);
    assert!(matches!(
        next_event(&mut events_a).await,
        SyncEvent::PeerJoined(_)
    ));

    let mut shape = CanvasObject::new("box", ObjectKind::Shape, 0.0, 0.0);
    shape.width = Some(100.0);
    shape.content = Some("label".into());
    client_b.create_object(shape).await.unwrap();
    assert!(matches!(
        next_event(&mut events_a).await,
        SyncEvent::ObjectCreated(_)
    ));

    // Partial update keeps unspecified fields
    let mut patch = ObjectPatch::new("box");
    patch.x = Some(50.0);
    client_a.update_object(patch).await.unwrap();
    match next_event(&mut events_b).await {
        SyncEvent::ObjectUpdated(obj) => {
            assert_eq!(obj.x, 50.0);
            assert_eq!(obj.width, Some(100.0));
            assert_eq!(obj.content.as_deref(), Some("label"));
        }
        other => panic!("Expected ObjectUpdated, got {other:?}"),
    }

    // Deleting an id that does not exist still advances the version
    client_a.delete_object("ghost").await.unwrap();
    assert_eq!(
        next_event(&mut events_b).await,
        SyncEvent::ObjectDeleted("ghost".into())
    );

    client_b.delete_object("box").await.unwrap();
    assert_eq!(
        next_event(&mut events_a).await,
        SyncEvent::ObjectDeleted("box".into())
    );

    let stored = server.store.read_document(wb).await.unwrap();
    assert_eq!(stored.content.version, 4);
    assert!(stored.content.is_empty());
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let server = TestServer::start().await;
    let (alice, alice_token) = server.member("Alice").await;
    let wb = server.store.create_whiteboard("Errors", alice).await;
    let mut ws = server.raw().await;

    raw_send(&mut ws, "{not json".into()).await;
    assert_eq!(
        raw_recv(&mut ws).await,
        ServerMessage::error("Invalid message format")
    );

    raw_send(&mut ws, format!(r#"{{"type":"dance","whiteboardId":"{wb}"}}"#)).await;
    assert_eq!(
        raw_recv(&mut ws).await,
        ServerMessage::error("Unknown message type: dance")
    );

    raw_send(
        &mut ws,
        format!(r#"{{"type":"cursor","whiteboardId":"{wb}","data":{{"x":1,"y":2}}}}"#),
    )
    .await;
    assert_eq!(
        raw_recv(&mut ws).await,
        ServerMessage::error("Not joined to a whiteboard")
    );

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert_eq!(
        raw_recv(&mut ws).await,
        ServerMessage::error("Binary frames are not supported")
    );

    // Still usable after all of the above
    raw_send(
        &mut ws,
        format!(r#"{{"type":"join","whiteboardId":"{wb}","data":{{"token":"{alice_token}"}}}}"#),
    )
    .await;
    assert!(matches!(
        raw_recv(&mut ws).await,
        ServerMessage::Joined { .. }
    ));
    assert!(server.server.stats().await.rejected_frames >= 1);
}

#[tokio::test]
async fn test_join_rejections() {
    let server = TestServer::start().await;
    let (alice, _) = server.member("Alice").await;
    let (_, mallory_token) = server.member("Mallory").await;
    let wb = server.store.create_whiteboard("Private", alice).await;

    let (client, mut events) = server.client(wb).await;

    client.join("not-a-token").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Error("Invalid token".into())
    );

    client.join(mallory_token.clone()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Error("Access denied".into())
    );

    let (other, mut other_events) = server.client(Uuid::new_v4()).await;
    other.join(mallory_token).await.unwrap();
    assert_eq!(
        next_event(&mut other_events).await,
        SyncEvent::Error("Whiteboard not found".into())
    );

    assert_eq!(server.server.stats().await.active_rooms, 0);
}

#[tokio::test]
async fn test_rejoin_evicts_previous_connection() {
    let server = TestServer::start().await;
    let (alice, alice_token) = server.member("Alice").await;
    let wb = server.store.create_whiteboard("Tabs", alice).await;

    let (first, mut first_events) = server.client(wb).await;
    first.join(alice_token.clone()).await.unwrap();
    joined_users(next_event(&mut first_events).await);

    let (second, mut second_events) = server.client(wb).await;
    second.join(alice_token).await.unwrap();
    let users = joined_users(next_event(&mut second_events).await);
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].color, PALETTE[0]);

    // The superseded connection is closed by the server
    assert_eq!(next_event(&mut first_events).await, SyncEvent::Disconnected);
    assert_eq!(first.connection_state().await, ConnectionState::Disconnected);
    server.wait_for_connections(1).await;

    // The new connection is still a member
    assert_eq!(
        server.server.engine().registry().member_count(wb).await,
        1
    );
    second
        .create_object(CanvasObject::new("a", ObjectKind::Line, 0.0, 0.0))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server.store.read_document(wb).await.unwrap().content.version,
        1
    );
}

#[tokio::test]
async fn test_room_closes_after_last_leave() {
    let server = TestServer::start().await;
    let (alice, alice_token) = server.member("Alice").await;
    let wb = server.store.create_whiteboard("Scratch", alice).await;

    let (client, mut events) = server.client(wb).await;
    client.join(alice_token).await.unwrap();
    joined_users(next_event(&mut events).await);
    server.wait_for_rooms(1).await;

    client.leave().await.unwrap();
    server.wait_for_rooms(0).await;

    // Left is terminal for this connection
    client
        .create_object(CanvasObject::new("late", ObjectKind::Text, 0.0, 0.0))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Error("Connection has already left".into())
    );
}

#[tokio::test]
async fn test_room_capacity() {
    let server = TestServer::start_with(ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    })
    .await;
    let (alice, alice_token) = server.member("Alice").await;
    let (bob, bob_token) = server.member("Bob").await;
    let wb = server.store.create_whiteboard("Tiny", alice).await;
    server.store.grant(wb, bob, PermissionLevel::Commenter).await;

    let (a, mut events_a) = server.client(wb).await;
    a.join(alice_token).await.unwrap();
    joined_users(next_event(&mut events_a).await);

    let (b, mut events_b) = server.client(wb).await;
    b.join(bob_token).await.unwrap();
    match next_event(&mut events_b).await {
        SyncEvent::Error(message) => assert!(message.contains("full"), "{message}"),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert_quiet(&mut events_a).await;
}

#[tokio::test]
async fn test_idle_connection_closed() {
    let server = TestServer::start_with(ServerConfig {
        heartbeat_interval_secs: 1,
        idle_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;

    // Never read, so pings go unanswered
    let _ws = server.raw().await;
    server.wait_for_connections(1).await;
    server.wait_for_connections(0).await;
}
