//! Shared event and record types for the Conclave client library.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topics a consumer can subscribe to on the event bus.
///
/// `Any` is the wildcard topic: handlers registered under it run for every
/// emitted event, before the kind-specific handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[default]
    Any,
    /// The transport reported a traffic rate limit (legacy framing only).
    RateLimited,
    /// The requested nickname is taken. Policy (rename vs quit) is the
    /// consumer's; the connection itself is still alive.
    NicknameInUse,
    Disconnected,
    Connected,
    UserJoined,
    UserLeft,
    GroupMessage,
    PrivateMessage,
    SmpQuestion,
    SmpSuccess,
    SmpFailure,
    Composing,
    Paused,
    ColorModify,
    FileAttachment,
    SubscribedToModerator,
    RoomJoined,
    WebRtcCapable,
    WebRtcOffer,
    WebRtcAnswer,
    WebRtcIceCandidate,
}

/// A single occurrence surfaced to consumers.
///
/// Fields not meaningful for a given kind are left at their defaults, the
/// same way the wire formats omit empty fields.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub kind: EventKind,
    /// True when the event originated on the private (direct) channel.
    pub private: bool,
    pub room: String,
    pub user: String,
    pub body: String,
    pub file: Option<FileRecord>,
}

/// An encrypted-attachment pointer carried inside a BEX `FILE_ATTACHMENT`
/// record. The blob itself lives on an external HTTP service; this record
/// is what peers need to fetch and decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Length of the random padding prefix to strip after decryption.
    pub prefix_size: u64,
    pub key: [u8; 32],
    pub nonce: [u8; 24],
    pub mime: String,
    pub uuid: Uuid,
}

/// ICE candidate payload as rendered into `WebRtcIceCandidate` event bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub data: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u64,
}
