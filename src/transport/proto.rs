//! Modern wire framing: one ASCII kind byte followed by a UTF-8 JSON
//! object. Kinds: `j` join, `l` leave, `g` group, `p` private, `r`
//! roster, `e` error.

use super::{Frame, FrameError};
use serde::{Deserialize, Serialize};

pub const TAG_JOIN: u8 = b'j';
pub const TAG_LEAVE: u8 = b'l';
pub const TAG_GROUP: u8 = b'g';
pub const TAG_PRIVATE: u8 = b'p';
pub const TAG_ROSTER: u8 = b'r';
pub const TAG_ERROR: u8 = b'e';

#[derive(Serialize, Deserialize, Default)]
struct JoinPayload {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    room: String,
}

#[derive(Serialize, Deserialize, Default)]
struct LeavePayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
}

#[derive(Serialize, Deserialize, Default)]
struct GroupPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Deserialize, Default)]
struct PrivatePayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    to: String,
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Deserialize, Default)]
struct RosterPayload {
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct ErrorPayload {
    #[serde(default)]
    error: String,
}

/// Encode a frame as one wire text message.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    fn pack<T: Serialize>(tag: u8, payload: &T) -> Result<String, FrameError> {
        let mut out = String::new();
        out.push(tag as char);
        out.push_str(&serde_json::to_string(payload)?);
        Ok(out)
    }

    match frame {
        Frame::Join { name, room } => pack(
            TAG_JOIN,
            &JoinPayload {
                name: name.clone(),
                room: room.clone(),
            },
        ),
        Frame::Leave { name } => pack(TAG_LEAVE, &LeavePayload { name: name.clone() }),
        Frame::Group { name, text } => pack(
            TAG_GROUP,
            &GroupPayload {
                name: name.clone(),
                text: text.clone(),
            },
        ),
        Frame::Private { from, to, text } => pack(
            TAG_PRIVATE,
            &PrivatePayload {
                from: from.clone(),
                to: to.clone(),
                text: text.clone(),
            },
        ),
        Frame::Roster { users } => pack(
            TAG_ROSTER,
            &RosterPayload {
                users: users.clone(),
            },
        ),
        Frame::Error { error } => pack(
            TAG_ERROR,
            &ErrorPayload {
                error: error.clone(),
            },
        ),
        // the modern wire expresses nickname conflicts as an error frame
        Frame::NicknameInUse => pack(
            TAG_ERROR,
            &ErrorPayload {
                error: "Nickname in use.".to_string(),
            },
        ),
        Frame::RateLimited | Frame::Disconnected => Err(FrameError::Unrepresentable),
    }
}

/// Decode one wire text message into a frame.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    // every known tag is ASCII, so slicing after it is safe; an unknown
    // multi-byte first character never reaches the payload parse
    let body = text.get(1..).unwrap_or_default();

    Ok(match bytes[0] {
        TAG_JOIN => {
            let p: JoinPayload = serde_json::from_str(body)?;
            Frame::Join {
                name: p.name,
                room: p.room,
            }
        }
        TAG_LEAVE => {
            let p: LeavePayload = serde_json::from_str(body)?;
            Frame::Leave { name: p.name }
        }
        TAG_GROUP => {
            let p: GroupPayload = serde_json::from_str(body)?;
            Frame::Group {
                name: p.name,
                text: p.text,
            }
        }
        TAG_PRIVATE => {
            let p: PrivatePayload = serde_json::from_str(body)?;
            Frame::Private {
                from: p.from,
                to: p.to,
                text: p.text,
            }
        }
        TAG_ROSTER => {
            let p: RosterPayload = serde_json::from_str(body)?;
            Frame::Roster { users: p.users }
        }
        TAG_ERROR => {
            let p: ErrorPayload = serde_json::from_str(body)?;
            Frame::Error { error: p.error }
        }
        other => return Err(FrameError::UnknownTag(other as char)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_both_directions() {
        // client→server carries the room
        let wire = encode(&Frame::Join {
            name: "alice".into(),
            room: "lobby".into(),
        })
        .unwrap();
        assert_eq!(wire, r#"j{"name":"alice","room":"lobby"}"#);

        // server→client announcement omits it
        let wire = encode(&Frame::Join {
            name: "bob".into(),
            room: String::new(),
        })
        .unwrap();
        assert_eq!(wire, r#"j{"name":"bob"}"#);
        assert_eq!(
            decode(&wire).unwrap(),
            Frame::Join {
                name: "bob".into(),
                room: String::new(),
            }
        );
    }

    #[test]
    fn round_trip_each_kind() {
        let frames = vec![
            Frame::Leave {
                name: "carol".into(),
            },
            Frame::Group {
                name: "alice".into(),
                text: "ciphertext".into(),
            },
            Frame::Private {
                from: "alice".into(),
                to: String::new(),
                text: "hi".into(),
            },
            Frame::Roster {
                users: vec!["a".into(), "b".into()],
            },
            Frame::Error {
                error: "Recipient not in room.".into(),
            },
        ];
        for frame in frames {
            assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
        }
    }

    #[test]
    fn empty_leave_payload() {
        // a leaving client sends no name; the server fills it in
        let wire = encode(&Frame::Leave {
            name: String::new(),
        })
        .unwrap();
        assert_eq!(wire, "l{}");
        assert_eq!(
            decode("l{}").unwrap(),
            Frame::Leave {
                name: String::new(),
            }
        );
    }

    #[test]
    fn nickname_in_use_encodes_as_error() {
        let wire = encode(&Frame::NicknameInUse).unwrap();
        assert_eq!(
            decode(&wire).unwrap(),
            Frame::Error {
                error: "Nickname in use.".into(),
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode(""), Err(FrameError::Empty)));
        assert!(matches!(decode("x{}"), Err(FrameError::UnknownTag('x'))));
        assert!(matches!(decode("j{not json"), Err(FrameError::Json(_))));
    }
}
