//! WebSocket transports. One socket per room, owned exclusively by the
//! room task that dialed it.
//!
//! Per the error policy, a malformed single frame is logged and dropped
//! while the stream continues; socket-level failures are fatal and
//! propagate to the supervisor.

use super::legacy::{self, Jid, RoomContext, StanzaKind, MAX_STANZA_SIZE};
use super::{proto, Frame, TransportError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which wire framing a connection speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Modern,
    Legacy,
}

/// A room's transport, already dialed.
pub enum RoomTransport {
    Modern(ModernWs),
    Legacy(LegacyWs),
}

impl RoomTransport {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match self {
            RoomTransport::Modern(t) => t.send_frame(frame).await,
            RoomTransport::Legacy(t) => t.send_frame(frame).await,
        }
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        match self {
            RoomTransport::Modern(t) => t.recv_frame().await,
            RoomTransport::Legacy(t) => t.recv_frame().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            RoomTransport::Modern(t) => t.close().await,
            RoomTransport::Legacy(t) => t.close().await,
        }
    }
}

/// Modern framing over WebSocket text messages.
pub struct ModernWs {
    stream: WsStream,
}

impl ModernWs {
    pub async fn dial(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url).await?;
        Ok(ModernWs { stream })
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = proto::encode(frame)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(Frame::Disconnected),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => match proto::decode(&text) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed frame");
                    }
                },
                Some(Ok(_)) => {}
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Legacy framing: XMPP-subset stanzas over WebSocket, one room per
/// connection. `dial` performs the anonymous stream handshake; the MUC
/// entry presences go out when the coordinator sends its `Join` frame.
pub struct LegacyWs {
    stream: WsStream,
    jid: String,
    host: String,
    room: String,
    conference: String,
    nick: String,
}

impl LegacyWs {
    pub async fn dial(
        url: &str,
        host: &str,
        conference: &str,
        room: &str,
        nick: &str,
    ) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(TransportError::Ws)?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));
        let (stream, _) = connect_async(request).await?;

        let mut conn = LegacyWs {
            stream,
            jid: String::new(),
            host: host.to_string(),
            room: room.to_string(),
            conference: conference.to_string(),
            nick: nick.to_string(),
        };
        conn.handshake().await?;
        Ok(conn)
    }

    /// Anonymous SASL stream setup: open, auth, reopen, bind, session.
    async fn handshake(&mut self) -> Result<(), TransportError> {
        self.send_text(&legacy::open_stanza(&self.host.clone())).await?;
        self.recv_text().await?;
        self.recv_text().await?;
        self.send_text(&legacy::auth_stanza()).await?;
        self.recv_text().await?;
        self.send_text(&legacy::open_stanza(&self.host.clone())).await?;
        self.recv_text().await?;
        self.recv_text().await?;
        self.send_text(&legacy::bind_stanza()).await?;

        let bind_result = self.recv_text().await?;
        let stanza = legacy::parse_stanza(&bind_result)?;
        if stanza.bind_jid.is_empty() {
            return Err(TransportError::Handshake(
                "stream bind returned no jid".to_string(),
            ));
        }
        self.jid = stanza.bind_jid;

        self.send_text(&legacy::session_stanza()).await?;
        self.recv_text().await?;
        Ok(())
    }

    fn room_context(&self) -> RoomContext<'_> {
        RoomContext {
            room: &self.room,
            conference: &self.conference,
            nick: &self.nick,
        }
    }

    fn muc_jid(&self) -> Jid {
        Jid {
            local: self.room.clone(),
            host: self.conference.clone(),
            node: self.nick.clone(),
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_STANZA_SIZE {
                        debug!(len = text.len(), "dropping oversized stanza");
                        continue;
                    }
                    return Ok(text);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Join { .. } => {
                let muc = self.muc_jid();
                let [first, second] = legacy::join_muc_stanzas(&self.jid.clone(), &muc);
                self.send_text(&first).await?;
                self.send_text(&second).await?;
                Ok(())
            }
            _ => {
                let stanza = legacy::frame_to_stanza(frame, &self.room_context(), &self.jid)?;
                self.send_text(&stanza).await
            }
        }
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let text = match self.recv_text().await {
                Ok(text) => text,
                Err(TransportError::Closed) => return Ok(Frame::Disconnected),
                Err(e) => return Err(e),
            };

            let stanza = match legacy::parse_stanza(&text) {
                Ok(stanza) => stanza,
                Err(e) => {
                    warn!(error = %e, "dropping malformed stanza");
                    continue;
                }
            };

            if stanza.kind == StanzaKind::Iq && stanza.ping {
                let response = legacy::ping_response(&self.host.clone(), &stanza.id);
                self.send_text(&response).await?;
                continue;
            }

            if let Some(frame) = legacy::stanza_to_frame(&stanza, &self.room_context()) {
                return Ok(frame);
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.send_text(&legacy::close_stanza()).await;
        let _ = self.stream.close(None).await;
    }
}
