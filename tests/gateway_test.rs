//! Gateway integration tests: an in-process gateway driven by real
//! WebSocket clients.
//!
//! Run with: cargo test --test gateway_test

use conclave::gateway::Gateway;
use conclave::transport::proto;
use conclave::Frame;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(port: u16) -> TestClient {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("client connect");
        TestClient { ws }
    }

    async fn send(&mut self, frame: Frame) {
        let text = proto::encode(&frame).expect("encode");
        self.ws.send(Message::Text(text)).await.expect("send");
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send raw");
    }

    async fn recv(&mut self) -> Frame {
        let deadline = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await.expect("stream ended").expect("recv") {
                    Message::Text(text) => return proto::decode(&text).expect("decode"),
                    _ => continue,
                }
            }
        });
        deadline.await.expect("timed out waiting for frame")
    }

    /// True if the server closed the stream (or errored) before sending
    /// another text frame.
    async fn closed(&mut self) -> bool {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                    Some(Ok(Message::Text(_))) => return false,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

async fn start_gateway() -> (Arc<Gateway>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let gateway = Gateway::new();
    tokio::spawn(gateway.clone().serve(listener));
    (gateway, port)
}

fn join(name: &str, room: &str) -> Frame {
    Frame::Join {
        name: name.into(),
        room: room.into(),
    }
}

#[tokio::test]
async fn nickname_conflict_then_clean_join() {
    let (_gateway, port) = start_gateway().await;

    let mut a = TestClient::connect(port).await;
    a.send(join("a", "x")).await;
    assert_eq!(a.recv().await, Frame::Roster { users: vec![] });

    let mut b = TestClient::connect(port).await;
    b.send(join("a", "x")).await;
    assert_eq!(
        b.recv().await,
        Frame::Error {
            error: "Nickname in use.".into()
        }
    );

    b.send(join("b", "x")).await;
    assert_eq!(
        b.recv().await,
        Frame::Roster {
            users: vec!["a".into()]
        }
    );
    // existing user is told; the joiner is not echoed its own announcement
    assert_eq!(
        a.recv().await,
        Frame::Join {
            name: "b".into(),
            room: String::new()
        }
    );

    a.send(Frame::Group {
        name: String::new(),
        text: "probe".into(),
    })
    .await;
    // first frame b sees after its roster is the group probe, not a self-join
    assert_eq!(
        b.recv().await,
        Frame::Group {
            name: "a".into(),
            text: "probe".into()
        }
    );
}

#[tokio::test]
async fn group_messages_reach_the_whole_room() {
    let (_gateway, port) = start_gateway().await;

    let mut a = TestClient::connect(port).await;
    a.send(join("a", "x")).await;
    a.recv().await;
    let mut b = TestClient::connect(port).await;
    b.send(join("b", "x")).await;
    b.recv().await;
    a.recv().await; // b's join announcement

    b.send(Frame::Group {
        name: String::new(),
        text: "opaque ciphertext".into(),
    })
    .await;

    let expected = Frame::Group {
        name: "b".into(),
        text: "opaque ciphertext".into(),
    };
    // the sender is echoed too
    assert_eq!(a.recv().await, expected);
    assert_eq!(b.recv().await, expected);
}

#[tokio::test]
async fn private_messages_route_to_one_recipient() {
    let (_gateway, port) = start_gateway().await;

    let mut a = TestClient::connect(port).await;
    a.send(join("a", "x")).await;
    a.recv().await;
    let mut b = TestClient::connect(port).await;
    b.send(join("b", "x")).await;
    b.recv().await;
    a.recv().await;

    a.send(Frame::Private {
        from: String::new(),
        to: "b".into(),
        text: "psst".into(),
    })
    .await;
    assert_eq!(
        b.recv().await,
        Frame::Private {
            from: "a".into(),
            to: String::new(),
            text: "psst".into()
        }
    );

    a.send(Frame::Private {
        from: String::new(),
        to: "ghost".into(),
        text: "anyone?".into(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        Frame::Error {
            error: "Recipient not in room.".into()
        }
    );
}

#[tokio::test]
async fn rooms_die_with_their_last_user() {
    let (gateway, port) = start_gateway().await;

    let mut a = TestClient::connect(port).await;
    a.send(join("a", "x")).await;
    a.recv().await;
    let mut b = TestClient::connect(port).await;
    b.send(join("b", "y")).await;
    b.recv().await;
    assert_eq!(gateway.room_count().await, 2);

    a.send(Frame::Leave {
        name: String::new(),
    })
    .await;
    b.send(Frame::Leave {
        name: String::new(),
    })
    .await;

    tokio::time::timeout(RECV_TIMEOUT, async {
        while gateway.room_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rooms should be reaped");
}

#[tokio::test]
async fn name_bounds_are_enforced() {
    let (_gateway, port) = start_gateway().await;

    let mut c = TestClient::connect(port).await;
    c.send(join("", "x")).await;
    assert_eq!(
        c.recv().await,
        Frame::Error {
            error: "Nickname must be between 1 and 128 characters.".into()
        }
    );

    c.send(join("ok", &"r".repeat(129))).await;
    assert_eq!(
        c.recv().await,
        Frame::Error {
            error: "Room name must be between 1 and 128 characters.".into()
        }
    );

    c.send(join(&"n".repeat(128), &"r".repeat(128))).await;
    assert_eq!(c.recv().await, Frame::Roster { users: vec![] });
}

#[tokio::test]
async fn acting_before_joining_is_an_error() {
    let (_gateway, port) = start_gateway().await;

    let mut c = TestClient::connect(port).await;
    c.send(Frame::Group {
        name: String::new(),
        text: "into the void".into(),
    })
    .await;
    assert_eq!(
        c.recv().await,
        Frame::Error {
            error: "You need to join a room to do that.".into()
        }
    );

    c.send(join("c", "x")).await;
    c.recv().await;
    c.send(join("c", "x")).await;
    assert_eq!(
        c.recv().await,
        Frame::Error {
            error: "You have already joined a room.".into()
        }
    );
}

#[tokio::test]
async fn protocol_violations_terminate_the_session() {
    let (gateway, port) = start_gateway().await;

    let mut c = TestClient::connect(port).await;
    c.send(join("c", "x")).await;
    c.recv().await;
    c.send_raw("z{\"what\":\"ever\"}").await;
    assert!(c.closed().await, "unknown tag should close the session");

    // the terminated client's membership is cleaned up
    tokio::time::timeout(RECV_TIMEOUT, async {
        while gateway.room_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dead client should be reaped");
}
