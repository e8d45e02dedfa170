//! Legacy wire framing: an XMPP-subset XML stream over WebSocket.
//!
//! Only the stanza shapes the protocol actually exchanges are understood:
//! `<presence>` for join/leave/nickname conflicts, `<message>` for group
//! and direct bodies, `<iq>` for bind results and server pings. Everything
//! decodes into the same abstract [`Frame`] set as the modern framing.
//!
//! Roster translation: each occupant presence that arrives before our own
//! echo becomes a `Join` announcement; the self-presence echo becomes an
//! empty `Roster` frame, which the coordinator treats as the join ack.

use super::{Frame, FrameError};
use xml::reader::{EventReader, XmlEvent};

/// Stanzas larger than this are dropped without parsing.
pub const MAX_STANZA_SIZE: usize = 75_000;

const RATE_LIMIT_TEXT: &str = "Traffic rate limit is exceeded";

/// `local@host/node` address. For MUC traffic the local part is the room,
/// the host is the conference service and the node is the nickname.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Jid {
    pub local: String,
    pub host: String,
    pub node: String,
}

impl Jid {
    pub fn parse(s: &str) -> Result<Jid, FrameError> {
        let (local, rest) = s
            .split_once('@')
            .ok_or_else(|| FrameError::Xml(format!("jid without @: {s}")))?;
        let (host, node) = match rest.split_once('/') {
            Some((h, n)) => (h, unescape_local(n)),
            None => (rest, String::new()),
        };
        Ok(Jid {
            local: local.to_string(),
            host: host.to_string(),
            node,
        })
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.host)?;
        if !self.node.is_empty() {
            write!(f, "/{}", self.node)?;
        }
        Ok(())
    }
}

const ESCAPES: [(char, &str); 10] = [
    (' ', "\\20"),
    ('"', "\\22"),
    ('&', "\\26"),
    ('\'', "\\27"),
    ('/', "\\2f"),
    (':', "\\3a"),
    ('<', "\\3c"),
    ('>', "\\3e"),
    ('@', "\\40"),
    ('\\', "\\5c"),
];

/// JID-escape a local part (XEP-0106 subset).
pub fn escape_local(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, esc)) => out.push_str(esc),
            None => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_local`]. Unknown escapes pass through untouched.
pub fn unescape_local(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let pair: String = chars.clone().take(2).collect();
        let seq = format!("\\{pair}");
        match ESCAPES.iter().find(|(_, esc)| **esc == seq) {
            Some((raw, _)) => {
                out.push(*raw);
                chars.next();
                chars.next();
            }
            None => out.push(c),
        }
    }
    out
}

/// A parsed inbound stanza, reduced to the fields the framer consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStanza {
    pub kind: StanzaKind,
    pub from: String,
    pub to: String,
    pub typ: String,
    pub id: String,
    pub body: String,
    pub error_code: Option<u32>,
    pub error_text: String,
    pub bind_jid: String,
    pub ping: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StanzaKind {
    #[default]
    Other,
    Presence,
    Message,
    Iq,
}

/// Parse one stanza. Collects only the subset of structure the framer
/// needs; unknown children are ignored.
pub fn parse_stanza(input: &str) -> Result<RawStanza, FrameError> {
    let mut stanza = RawStanza::default();
    let mut stack: Vec<String> = Vec::new();

    let parser = EventReader::new(input.as_bytes());
    for event in parser {
        match event.map_err(|e| FrameError::Xml(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let local = name.local_name;
                if stack.is_empty() {
                    stanza.kind = match local.as_str() {
                        "presence" => StanzaKind::Presence,
                        "message" => StanzaKind::Message,
                        "iq" => StanzaKind::Iq,
                        _ => StanzaKind::Other,
                    };
                    for attr in &attributes {
                        match attr.name.local_name.as_str() {
                            "from" => stanza.from = attr.value.clone(),
                            "to" => stanza.to = attr.value.clone(),
                            "type" => stanza.typ = attr.value.clone(),
                            "id" => stanza.id = attr.value.clone(),
                            _ => {}
                        }
                    }
                } else {
                    match local.as_str() {
                        "error" => {
                            for attr in &attributes {
                                if attr.name.local_name == "code" {
                                    stanza.error_code = attr.value.parse().ok();
                                }
                            }
                        }
                        "ping" => stanza.ping = true,
                        _ => {}
                    }
                }
                stack.push(local);
            }
            XmlEvent::EndElement { .. } => {
                stack.pop();
            }
            XmlEvent::Characters(text) => match stack.last().map(String::as_str) {
                Some("body") => stanza.body.push_str(&text),
                Some("text") => stanza.error_text.push_str(&text),
                Some("jid") => stanza.bind_jid.push_str(&text),
                Some("code") => stanza.error_code = text.trim().parse().ok(),
                _ => {}
            },
            _ => {}
        }
    }

    Ok(stanza)
}

/// The per-room view a legacy connection translates stanzas against.
pub struct RoomContext<'a> {
    pub room: &'a str,
    pub conference: &'a str,
    pub nick: &'a str,
}

/// Translate a parsed stanza into a frame for this room, if it concerns
/// this room at all. `None` means the stanza carries nothing the
/// coordinator acts on (pings are answered at the transport layer).
pub fn stanza_to_frame(stanza: &RawStanza, ctx: &RoomContext<'_>) -> Option<Frame> {
    match stanza.kind {
        StanzaKind::Presence => {
            let from = Jid::parse(&stanza.from).ok()?;
            if from.local != ctx.room || from.host != ctx.conference {
                return None;
            }
            match stanza.typ.as_str() {
                "error" if stanza.error_code == Some(409) => Some(Frame::NicknameInUse),
                "error" => Some(Frame::Error {
                    error: format!(
                        "presence error {}: {}",
                        stanza.error_code.unwrap_or(0),
                        stanza.error_text
                    ),
                }),
                "unavailable" => Some(Frame::Leave { name: from.node }),
                _ if from.node == ctx.nick => Some(Frame::Roster { users: Vec::new() }),
                _ => Some(Frame::Join {
                    name: from.node,
                    room: String::new(),
                }),
            }
        }
        StanzaKind::Message => {
            if stanza.typ == "error" {
                if stanza.error_text == RATE_LIMIT_TEXT {
                    return Some(Frame::RateLimited);
                }
                return Some(Frame::Error {
                    error: stanza.error_text.clone(),
                });
            }
            let from = Jid::parse(&stanza.from).ok()?;
            if from.local != ctx.room {
                return None;
            }
            match stanza.typ.as_str() {
                "groupchat" => {
                    // typing notifications ride on ids, carry no body
                    if stanza.id == "composing" || stanza.id == "paused" || stanza.body.is_empty() {
                        return None;
                    }
                    Some(Frame::Group {
                        name: from.node,
                        text: stanza.body.clone(),
                    })
                }
                "chat" => Some(Frame::Private {
                    from: from.node,
                    to: String::new(),
                    text: stanza.body.clone(),
                }),
                _ => None,
            }
        }
        StanzaKind::Iq | StanzaKind::Other => None,
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn open_stanza(host: &str) -> String {
    format!(
        "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='{}' version='1.0'/>",
        xml_escape(host)
    )
}

pub fn auth_stanza() -> String {
    "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>".to_string()
}

pub fn bind_stanza() -> String {
    "<iq type='set' id='_bind_auth_2' xmlns='jabber:client'>\
     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>"
        .to_string()
}

pub fn session_stanza() -> String {
    "<iq type='set' id='_session_auth_2' xmlns='jabber:client'>\
     <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>"
        .to_string()
}

pub fn close_stanza() -> String {
    "<close xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\" />".to_string()
}

/// The two presences that enter a MUC room.
pub fn join_muc_stanzas(jid: &str, muc_jid: &Jid) -> [String; 2] {
    let jid = xml_escape(jid);
    let muc = xml_escape(&muc_jid.to_string());
    [
        format!(
            "<presence from='{jid}' to='{muc}' xmlns='jabber:client'>\
             <x xmlns='http://jabber.org/protocol/muc'/></presence>"
        ),
        format!("<presence from='{jid}' to='{muc}' xmlns='jabber:client'><show/><status/></presence>"),
    ]
}

pub fn leave_muc_stanza(jid: &str, muc_jid: &Jid) -> String {
    format!(
        "<presence from='{}' to='{}' type='unavailable' xmlns='jabber:client'/>",
        xml_escape(jid),
        xml_escape(&muc_jid.to_string())
    )
}

pub fn message_stanza(jid: &str, recipient: &Jid, typ: &str, body: &str) -> String {
    format!(
        "<message to='{}' from='{}' type='{}' xmlns='jabber:client'>\
         <body xmlns='jabber:client'>{}</body>\
         <x xmlns='jabber:x:event'><active/></x></message>",
        xml_escape(&recipient.to_string()),
        xml_escape(jid),
        xml_escape(typ),
        xml_escape(body)
    )
}

pub fn ping_response(host: &str, id: &str) -> String {
    format!(
        "<iq type='result' to='{}' id='{}' xmlns='jabber:client'/>",
        xml_escape(host),
        xml_escape(id)
    )
}

/// Render an outbound frame as a stanza for this room.
pub fn frame_to_stanza(frame: &Frame, ctx: &RoomContext<'_>, jid: &str) -> Result<String, FrameError> {
    let room_jid = Jid {
        local: ctx.room.to_string(),
        host: ctx.conference.to_string(),
        node: String::new(),
    };
    match frame {
        Frame::Group { text, .. } => Ok(message_stanza(jid, &room_jid, "groupchat", text)),
        Frame::Private { to, text, .. } => {
            let target = Jid {
                node: to.clone(),
                ..room_jid
            };
            Ok(message_stanza(jid, &target, "chat", text))
        }
        Frame::Leave { .. } => {
            let own = Jid {
                node: ctx.nick.to_string(),
                ..room_jid
            };
            Ok(leave_muc_stanza(jid, &own))
        }
        _ => Err(FrameError::Unrepresentable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RoomContext<'static> = RoomContext {
        room: "lobby",
        conference: "conference.example.net",
        nick: "alice",
    };

    #[test]
    fn jid_round_trip() {
        let jid = Jid::parse("lobby@conference.example.net/bob").unwrap();
        assert_eq!(jid.local, "lobby");
        assert_eq!(jid.host, "conference.example.net");
        assert_eq!(jid.node, "bob");
        assert_eq!(jid.to_string(), "lobby@conference.example.net/bob");

        assert!(Jid::parse("no-at-sign").is_err());
    }

    #[test]
    fn local_part_escaping() {
        assert_eq!(escape_local("b o@b"), "b\\20o\\40b");
        assert_eq!(unescape_local("b\\20o\\40b"), "b o@b");
        // unknown escapes survive untouched
        assert_eq!(unescape_local("a\\99b"), "a\\99b");
        let jid = Jid::parse("lobby@conf/b\\20o\\40b").unwrap();
        assert_eq!(jid.node, "b o@b");
    }

    #[test]
    fn group_message_stanza() {
        let stanza = parse_stanza(
            "<message from='lobby@conference.example.net/bob' type='groupchat' \
             xmlns='jabber:client'><body>hello &amp; welcome</body></message>",
        )
        .unwrap();
        assert_eq!(
            stanza_to_frame(&stanza, &CTX),
            Some(Frame::Group {
                name: "bob".into(),
                text: "hello & welcome".into(),
            })
        );
    }

    #[test]
    fn typing_ids_are_dropped() {
        let stanza = parse_stanza(
            "<message from='lobby@conference.example.net/bob' type='groupchat' id='composing' \
             xmlns='jabber:client'><body/></message>",
        )
        .unwrap();
        assert_eq!(stanza_to_frame(&stanza, &CTX), None);
    }

    #[test]
    fn self_presence_is_roster_ack() {
        let stanza =
            parse_stanza("<presence from='lobby@conference.example.net/alice'/>").unwrap();
        assert_eq!(
            stanza_to_frame(&stanza, &CTX),
            Some(Frame::Roster { users: Vec::new() })
        );

        let stanza = parse_stanza("<presence from='lobby@conference.example.net/bob'/>").unwrap();
        assert_eq!(
            stanza_to_frame(&stanza, &CTX),
            Some(Frame::Join {
                name: "bob".into(),
                room: String::new(),
            })
        );
    }

    #[test]
    fn unavailable_is_leave() {
        let stanza = parse_stanza(
            "<presence from='lobby@conference.example.net/bob' type='unavailable'/>",
        )
        .unwrap();
        assert_eq!(
            stanza_to_frame(&stanza, &CTX),
            Some(Frame::Leave { name: "bob".into() })
        );
    }

    #[test]
    fn conflict_is_nickname_in_use() {
        let stanza = parse_stanza(
            "<presence from='lobby@conference.example.net/alice' type='error'>\
             <error code='409'><conflict/></error></presence>",
        )
        .unwrap();
        assert_eq!(stanza_to_frame(&stanza, &CTX), Some(Frame::NicknameInUse));
    }

    #[test]
    fn rate_limit_is_distinct() {
        let stanza = parse_stanza(
            "<message from='lobby@conference.example.net' type='error'>\
             <error><text>Traffic rate limit is exceeded</text></error></message>",
        )
        .unwrap();
        assert_eq!(stanza_to_frame(&stanza, &CTX), Some(Frame::RateLimited));
    }

    #[test]
    fn other_rooms_are_filtered() {
        let stanza = parse_stanza(
            "<message from='other@conference.example.net/bob' type='groupchat'>\
             <body>hi</body></message>",
        )
        .unwrap();
        assert_eq!(stanza_to_frame(&stanza, &CTX), None);
    }

    #[test]
    fn iq_ping_detected() {
        let stanza = parse_stanza(
            "<iq from='example.net' type='get' id='p1'>\
             <ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .unwrap();
        assert_eq!(stanza.kind, StanzaKind::Iq);
        assert!(stanza.ping);
        assert_eq!(stanza.id, "p1");
    }

    #[test]
    fn bind_result_jid() {
        let stanza = parse_stanza(
            "<iq type='result' id='_bind_auth_2'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>anon123@example.net/resource</jid></bind></iq>",
        )
        .unwrap();
        assert_eq!(stanza.bind_jid, "anon123@example.net/resource");
    }

    #[test]
    fn outbound_group_is_escaped() {
        let out = frame_to_stanza(
            &Frame::Group {
                name: String::new(),
                text: "a<b&c".into(),
            },
            &CTX,
            "anon@example.net/r",
        )
        .unwrap();
        assert!(out.contains("<body xmlns='jabber:client'>a&lt;b&amp;c</body>"));
        assert!(out.contains("type='groupchat'"));
    }
}
