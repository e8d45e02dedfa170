//! Transport framing.
//!
//! Two wire framings are supported: the modern single-byte-tagged JSON
//! protocol and the legacy XML (XMPP-subset) protocol. Both decode into
//! the same abstract [`Frame`] set, which is all the room coordinator
//! ever sees. Each room owns its transport socket exclusively.

pub mod legacy;
pub mod proto;
pub mod ws;

use thiserror::Error;

/// One protocol-level message, in either direction.
///
/// String fields not meaningful for a direction are left empty and are
/// omitted from the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client→server: request to join `room` as `name`.
    /// Server→client: announcement that `name` joined (room implied).
    Join { name: String, room: String },
    /// Client→server: leave the room. Server→client: `name` left.
    Leave { name: String },
    /// Group payload; `name` is the sender on the server→client path.
    Group { name: String, text: String },
    /// Direct payload; `to` outbound, `from` inbound.
    Private { from: String, to: String, text: String },
    /// Current occupants, excluding the receiving client. Doubles as the
    /// join acknowledgment: it is the first thing a joiner receives.
    Roster { users: Vec<String> },
    /// Server-reported error text.
    Error { error: String },
    /// The requested nickname is taken (legacy framing reports this
    /// distinctly; the modern framing uses an `Error` frame).
    NicknameInUse,
    /// Transport-level rate limiting (legacy framing only). Not fatal.
    RateLimited,
    /// Orderly end of stream.
    Disconnected,
}

/// Protocol-layer failure on a single frame. Per error policy these are
/// logged and the frame dropped; the stream continues.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag '{0}'")]
    UnknownTag(char),
    #[error("frame kind not representable on this wire")]
    Unrepresentable,
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed stanza: {0}")]
    Xml(String),
}

/// Transport-layer failure. Fatal to the current connection; the
/// supervisor reacts with backoff and reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport handshake failed: {0}")]
    Handshake(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}
