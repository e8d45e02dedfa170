//! End-to-end client tests: two supervisors talking through an
//! in-process gateway, full key agreement and encryption on the wire.
//!
//! Run with: cargo test --test client_test

use conclave::gateway::Gateway;
use conclave::{Conn, Database, EventKind, MemoryDb, Options};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const LONG: Duration = Duration::from_secs(20);

async fn start_gateway() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(Gateway::new().serve(listener));
    format!("ws://127.0.0.1:{port}/ws")
}

fn client(url: &str) -> Arc<Conn> {
    Conn::new(Options {
        url: url.to_string(),
        ..Default::default()
    })
}

fn spawn_run(conn: &Arc<Conn>) {
    let conn = conn.clone();
    tokio::spawn(async move {
        let _ = conn.run().await;
    });
}

/// Poll until `room`'s session on `conn` has established a key with
/// `peer`.
async fn wait_for_peer(conn: &Arc<Conn>, room: &str, peer: &str) {
    timeout(LONG, async {
        loop {
            if let Some(handle) = conn.room(room).await {
                let names = handle.usernames().await.unwrap_or_default();
                if names.iter().any(|n| n == peer) {
                    return;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peer never established");
}

#[tokio::test]
async fn encrypted_text_crosses_the_wire() {
    let url = start_gateway().await;
    let alice = client(&url);
    let bob = client(&url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bob.on(EventKind::GroupMessage, move |event| {
        let _ = tx.send((event.user, event.body));
    });

    spawn_run(&alice);
    spawn_run(&bob);
    alice.join_room("meadow", "alice").await.expect("alice join");
    bob.join_room("meadow", "bob").await.expect("bob join");

    wait_for_peer(&alice, "meadow", "bob").await;
    wait_for_peer(&bob, "meadow", "alice").await;

    alice.gm("meadow", "hello").await.expect("send");

    let (user, body) = timeout(LONG, rx.recv()).await.expect("timeout").expect("closed");
    assert_eq!(user, "alice");
    assert_eq!(body, "hello");

    // both ends agree on each other's fingerprints
    let alice_room = alice.room("meadow").await.unwrap();
    let bob_room = bob.room("meadow").await.unwrap();
    assert_eq!(
        alice_room.fingerprint(None).await.unwrap(),
        bob_room.fingerprint(Some("alice")).await.unwrap()
    );

    alice.disconnect();
    bob.disconnect();
}

#[tokio::test]
async fn room_joined_fires_after_debounce() {
    let url = start_gateway().await;
    let alice = client(&url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    alice.on(EventKind::RoomJoined, move |event| {
        let _ = tx.send(event.room);
    });

    spawn_run(&alice);
    alice.join_room("meadow", "alice").await.expect("join");

    let room = timeout(LONG, rx.recv()).await.expect("timeout").expect("closed");
    assert_eq!(room, "meadow");
    alice.disconnect();
}

#[tokio::test]
async fn introduction_color_reaches_peers() {
    let url = start_gateway().await;
    let alice = client(&url);
    let bob = client(&url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bob.on(EventKind::ColorModify, move |event| {
        let _ = tx.send((event.user, event.body));
    });

    spawn_run(&alice);
    spawn_run(&bob);
    alice.join_room("meadow", "alice").await.expect("alice join");
    bob.join_room("meadow", "bob").await.expect("bob join");
    wait_for_peer(&alice, "meadow", "bob").await;
    wait_for_peer(&bob, "meadow", "alice").await;

    // alice's join burst carries the default color over BEX
    let (user, body) = timeout(LONG, rx.recv()).await.expect("timeout").expect("closed");
    assert_eq!(user, "alice");
    assert_eq!(body, "#413ED1");

    alice.disconnect();
    bob.disconnect();
}

#[tokio::test]
async fn private_messages_pass_through_without_pairwise() {
    let url = start_gateway().await;
    let alice = client(&url);
    let bob = client(&url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bob.on(EventKind::PrivateMessage, move |event| {
        let _ = tx.send((event.user, event.body, event.private));
    });

    spawn_run(&alice);
    spawn_run(&bob);
    alice.join_room("meadow", "alice").await.expect("alice join");
    bob.join_room("meadow", "bob").await.expect("bob join");
    wait_for_peer(&alice, "meadow", "bob").await;
    wait_for_peer(&bob, "meadow", "alice").await;

    alice.dm("meadow", "bob", "psst").await.expect("dm");

    let (user, body, private) =
        timeout(LONG, rx.recv()).await.expect("timeout").expect("closed");
    assert_eq!(user, "alice");
    assert_eq!(body, "psst");
    assert!(private);

    alice.disconnect();
    bob.disconnect();
}

#[tokio::test]
async fn joined_rooms_are_persisted_for_rejoin() {
    let url = start_gateway().await;
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
    let alice = Conn::new(Options {
        url,
        db: Some(db.clone()),
        ..Default::default()
    });

    spawn_run(&alice);
    alice.join_room("meadow", "alice").await.expect("join");

    let raw = db.load("rooms").expect("rooms persisted");
    let map: std::collections::HashMap<String, String> =
        serde_json::from_str(&raw).expect("valid json");
    assert_eq!(map.get("meadow").map(String::as_str), Some("alice"));

    // identity key was lazily generated and is a valid 32-byte secret
    let identity = db.load("mp").expect("identity persisted");
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(identity.trim())
        .expect("valid base64");
    assert_eq!(decoded.len(), 32);

    alice.leave_room("meadow").await.expect("leave");
    let raw = db.load("rooms").expect("rooms key still present");
    let map: std::collections::HashMap<String, String> =
        serde_json::from_str(&raw).expect("valid json");
    assert!(map.is_empty());

    alice.disconnect();
}

#[tokio::test]
async fn disconnect_ends_run_cleanly() {
    let url = start_gateway().await;
    let alice = client(&url);

    let runner = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.run().await })
    };

    alice.join_room("meadow", "alice").await.expect("join");
    sleep(Duration::from_millis(100)).await;
    alice.disconnect();
    // idempotent
    alice.disconnect();

    let result = timeout(LONG, runner).await.expect("run never returned");
    assert!(result.expect("task panicked").is_ok());
}
