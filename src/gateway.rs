//! Reference gateway: relays framed JSON between the clients of a room.
//!
//! The gateway knows nothing about the cryptography riding inside group
//! and private payloads; it only enforces room membership, nickname
//! uniqueness and frame well-formedness. A room exists while it has at
//! least one user. Lock order is always the room index before any single
//! room, never the reverse.
//!
//! Per the error policy, semantic errors ("Nickname in use.", "Recipient
//! not in room.", ...) go back to the client as error frames; a
//! protocol-layer violation terminates that client's session.

use crate::transport::proto;
use crate::transport::Frame;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 128;

type Outbound = mpsc::UnboundedSender<String>;
type SharedRoom = Arc<Mutex<RoomState>>;

struct RoomState {
    name: String,
    users: HashMap<String, Outbound>,
}

impl RoomState {
    fn broadcast(&self, frame: &Frame, skip: Option<&str>) {
        if let Ok(text) = proto::encode(frame) {
            for (nick, tx) in &self.users {
                if Some(nick.as_str()) == skip {
                    continue;
                }
                let _ = tx.send(text.clone());
            }
        }
    }
}

#[derive(Default)]
pub struct Gateway {
    rooms: Mutex<HashMap<String, SharedRoom>>,
}

impl Gateway {
    pub fn new() -> Arc<Gateway> {
        Arc::new(Gateway::default())
    }

    /// Accept and serve clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "gateway listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                debug!(%addr, "client connected");
                gateway.handle_client(stream).await;
                debug!(%addr, "client disconnected");
            });
        }
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "websocket handshake failed");
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut joined: Option<(SharedRoom, String)> = None;

        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let frame = match proto::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    // protocol violation: drop this client, not the process
                    warn!(error = %e, "terminating client on malformed frame");
                    break;
                }
            };

            match frame {
                Frame::Join { name, room } => {
                    if joined.is_some() {
                        send_error(&tx, "You have already joined a room.");
                        continue;
                    }
                    match self.join(&room, &name, &tx).await {
                        Ok(handle) => joined = Some((handle, name)),
                        Err(reason) => send_error(&tx, reason),
                    }
                }
                Frame::Leave { .. } => match joined.take() {
                    Some((room, name)) => self.leave(&room, &name).await,
                    None => send_error(&tx, "You need to join a room to do that."),
                },
                Frame::Group { text, .. } => match &joined {
                    Some((room, name)) => {
                        let state = room.lock().await;
                        state.broadcast(
                            &Frame::Group {
                                name: name.clone(),
                                text,
                            },
                            None,
                        );
                    }
                    None => send_error(&tx, "You need to join a room to do that."),
                },
                Frame::Private { to, text, .. } => match &joined {
                    Some((room, name)) => {
                        let state = room.lock().await;
                        match state.users.get(&to) {
                            Some(recipient) => {
                                if let Ok(encoded) = proto::encode(&Frame::Private {
                                    from: name.clone(),
                                    to: String::new(),
                                    text,
                                }) {
                                    let _ = recipient.send(encoded);
                                }
                            }
                            None => send_error(&tx, "Recipient not in room."),
                        }
                    }
                    None => send_error(&tx, "You need to join a room to do that."),
                },
                other => {
                    warn!(frame = ?other, "terminating client on unexpected frame kind");
                    break;
                }
            }
        }

        if let Some((room, name)) = joined {
            self.leave(&room, &name).await;
        }
        writer.abort();
    }

    /// Add `nick` to `room_name`, creating the room on demand. Sends the
    /// roster to the joiner and announces the join to everyone else.
    async fn join(
        &self,
        room_name: &str,
        nick: &str,
        tx: &Outbound,
    ) -> Result<SharedRoom, &'static str> {
        if room_name.is_empty() || room_name.len() > MAX_NAME_LEN {
            return Err("Room name must be between 1 and 128 characters.");
        }
        if nick.is_empty() || nick.len() > MAX_NAME_LEN {
            return Err("Nickname must be between 1 and 128 characters.");
        }

        // room index first, then the room
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(room_name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RoomState {
                    name: room_name.to_string(),
                    users: HashMap::new(),
                }))
            })
            .clone();
        let mut state = room.lock().await;

        if state.users.contains_key(nick) {
            drop(state);
            return Err("Nickname in use.");
        }
        state.users.insert(nick.to_string(), tx.clone());

        let roster: Vec<String> = state
            .users
            .keys()
            .filter(|name| name.as_str() != nick)
            .cloned()
            .collect();
        if let Ok(encoded) = proto::encode(&Frame::Roster { users: roster }) {
            let _ = tx.send(encoded);
        }

        state.broadcast(
            &Frame::Join {
                name: nick.to_string(),
                room: String::new(),
            },
            Some(nick),
        );

        drop(state);
        drop(rooms);
        Ok(room)
    }

    /// Remove `nick`, announce the departure, and delete the room once the
    /// last user is gone.
    async fn leave(&self, room: &SharedRoom, nick: &str) {
        let mut rooms = self.rooms.lock().await;
        let mut state = room.lock().await;
        state.users.remove(nick);
        state.broadcast(
            &Frame::Leave {
                name: nick.to_string(),
            },
            None,
        );
        if state.users.is_empty() {
            rooms.remove(&state.name);
        }
    }

    /// Number of live rooms; empty rooms never linger.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

fn send_error(tx: &Outbound, reason: &str) {
    if let Ok(encoded) = proto::encode(&Frame::Error {
        error: reason.to_string(),
    }) {
        let _ = tx.send(encoded);
    }
}
