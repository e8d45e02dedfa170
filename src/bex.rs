//! Binary Extensions (BEX) codec.
//!
//! BEX layers typed structured records (typing indicators, colors, file
//! attachments, WebRTC signaling, moderation) on top of the opaque
//! plaintext channel. A BEX message is the magic prefix `04 45 FF`, a
//! varint record count, then that many records. Varints are little-endian
//! LEB128; strings are varint-length-prefixed UTF-8.
//!
//! Decoding is forward-compatible: a record with an unknown header is
//! logged and skipped without aborting the rest of the message.

use crate::types::FileRecord;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Separates a BEX message from regular plaintext.
pub const BEX_MAGIC: [u8; 3] = [0x04, 0x45, 0xFF];

/// Hard cap on records per message.
pub const MAX_RECORDS: u64 = 8;

/// Hard cap on entries in a moderation table.
pub const MAX_TABLE_ENTRIES: u64 = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BexError {
    #[error("not a BEX message")]
    NotBex,
    #[error("too many BEX records")]
    TooMany,
    #[error("moderation table too large")]
    TableTooLarge,
    #[error("truncated BEX message")]
    Truncated,
}

/// Record headers as they appear on the wire.
///
/// The numbering is part of the wire format and must not be reordered.
/// Unassigned values (2, 3, 16..30, 34..) are reserved; decoding skips
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Header {
    SetColor = 1,
    Composing = 4,
    Paused = 5,
    FileAttachment = 6,
    TextMessage = 7,
    FlagMeAsBot = 8,
    StatusOnline = 9,
    StatusAway = 10,
    ModElected = 11,
    RemoveDeadUsers = 12,
    SetModerationTable = 13,
    SetLockdownLevel = 14,
    WhitelistUser = 15,

    IceCandidate = 30,
    RtcOffer = 31,
    RtcAnswer = 32,
    RtcSignalCapability = 33,
}

impl Header {
    fn from_wire(v: u64) -> Option<Header> {
        Some(match v {
            1 => Header::SetColor,
            4 => Header::Composing,
            5 => Header::Paused,
            6 => Header::FileAttachment,
            7 => Header::TextMessage,
            8 => Header::FlagMeAsBot,
            9 => Header::StatusOnline,
            10 => Header::StatusAway,
            11 => Header::ModElected,
            12 => Header::RemoveDeadUsers,
            13 => Header::SetModerationTable,
            14 => Header::SetLockdownLevel,
            15 => Header::WhitelistUser,
            30 => Header::IceCandidate,
            31 => Header::RtcOffer,
            32 => Header::RtcAnswer,
            33 => Header::RtcSignalCapability,
            _ => return None,
        })
    }
}

/// A decoded BEX record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Composing,
    Paused,
    FlagMeAsBot,
    StatusOnline,
    StatusAway,
    RemoveDeadUsers,
    RtcSignalCapability,
    SetColor {
        rgb: [u8; 3],
    },
    FileAttachment(FileRecord),
    TextMessage {
        kind: String,
        message: String,
    },
    RtcOffer {
        target: String,
        sdp: String,
    },
    RtcAnswer {
        target: String,
        sdp: String,
    },
    IceCandidate {
        target: String,
        candidate: String,
        sdp_mline_index: u64,
        sdp_mid: String,
    },
    WhitelistUser {
        target: String,
    },
    ModElected {
        target: String,
    },
    SetLockdownLevel {
        level: u64,
    },
    SetModerationTable {
        key: String,
        entries: Vec<String>,
    },
}

impl Record {
    fn header(&self) -> Header {
        match self {
            Record::SetColor { .. } => Header::SetColor,
            Record::Composing => Header::Composing,
            Record::Paused => Header::Paused,
            Record::FileAttachment(_) => Header::FileAttachment,
            Record::TextMessage { .. } => Header::TextMessage,
            Record::FlagMeAsBot => Header::FlagMeAsBot,
            Record::StatusOnline => Header::StatusOnline,
            Record::StatusAway => Header::StatusAway,
            Record::ModElected { .. } => Header::ModElected,
            Record::RemoveDeadUsers => Header::RemoveDeadUsers,
            Record::SetModerationTable { .. } => Header::SetModerationTable,
            Record::SetLockdownLevel { .. } => Header::SetLockdownLevel,
            Record::WhitelistUser { .. } => Header::WhitelistUser,
            Record::IceCandidate { .. } => Header::IceCandidate,
            Record::RtcOffer { .. } => Header::RtcOffer,
            Record::RtcAnswer { .. } => Header::RtcAnswer,
            Record::RtcSignalCapability => Header::RtcSignalCapability,
        }
    }
}

/// True if `input` starts with the BEX magic.
pub fn is_bex(input: &[u8]) -> bool {
    input.len() >= 3 && input[..3] == BEX_MAGIC
}

/// Parse a `#RRGGBB` color string into raw RGB bytes.
pub fn parse_color(s: &str) -> Option<[u8; 3]> {
    let hex_part = s.strip_prefix('#')?;
    if hex_part.len() != 6 {
        return None;
    }
    let bytes = hex::decode(hex_part).ok()?;
    Some([bytes[0], bytes[1], bytes[2]])
}

/// Render RGB bytes as an uppercase `#RRGGBB` string.
pub fn render_color(rgb: [u8; 3]) -> String {
    format!("#{:02X}{:02X}{:02X}", rgb[0], rgb[1], rgb[2])
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BexError> {
        if self.buf.len() - self.pos < n {
            return Err(BexError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, BexError> {
        Ok(self.take(1)?[0])
    }

    /// Little-endian LEB128.
    fn varint(&mut self) -> Result<u64, BexError> {
        let mut out: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            out |= u64::from(b & 0x7f)
                .checked_shl(shift)
                .ok_or(BexError::Truncated)?;
            if b & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
            if shift >= 64 {
                return Err(BexError::Truncated);
            }
        }
    }

    fn ustring(&mut self) -> Result<String, BexError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| BexError::Truncated)?;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn varint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if v == 0 {
                return;
            }
        }
    }

    fn ustring(&mut self, s: &str) {
        self.varint(s.len() as u64);
        self.bytes(s.as_bytes());
    }
}

/// Decode a BEX message into its records.
///
/// Unknown headers are skipped (logged at warn); all other malformations
/// reject the whole message.
pub fn decode(input: &[u8]) -> Result<Vec<Record>, BexError> {
    let mut r = Reader::new(input);

    let magic = r.take(3).map_err(|_| BexError::NotBex)?;
    if magic != BEX_MAGIC {
        return Err(BexError::NotBex);
    }

    let count = r.varint()?;
    if count > MAX_RECORDS {
        return Err(BexError::TooMany);
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw_header = r.varint()?;
        let header = match Header::from_wire(raw_header) {
            Some(h) => h,
            None => {
                warn!(header = raw_header, "skipping unknown bex record");
                continue;
            }
        };

        let record = match header {
            Header::Composing => Record::Composing,
            Header::Paused => Record::Paused,
            Header::FlagMeAsBot => Record::FlagMeAsBot,
            Header::StatusOnline => Record::StatusOnline,
            Header::StatusAway => Record::StatusAway,
            Header::RemoveDeadUsers => Record::RemoveDeadUsers,
            Header::RtcSignalCapability => Record::RtcSignalCapability,
            Header::SetColor => {
                let rgb = r.take(3)?;
                Record::SetColor {
                    rgb: [rgb[0], rgb[1], rgb[2]],
                }
            }
            Header::FileAttachment => {
                let prefix_size = r.varint()?;
                let mut key = [0u8; 32];
                key.copy_from_slice(r.take(32)?);
                let mut nonce = [0u8; 24];
                nonce.copy_from_slice(r.take(24)?);
                let mime = r.ustring()?;
                let uuid = Uuid::from_slice(r.take(16)?).map_err(|_| BexError::Truncated)?;
                Record::FileAttachment(FileRecord {
                    prefix_size,
                    key,
                    nonce,
                    mime,
                    uuid,
                })
            }
            Header::TextMessage => Record::TextMessage {
                kind: r.ustring()?,
                message: r.ustring()?,
            },
            Header::RtcOffer => Record::RtcOffer {
                target: r.ustring()?,
                sdp: r.ustring()?,
            },
            Header::RtcAnswer => Record::RtcAnswer {
                target: r.ustring()?,
                sdp: r.ustring()?,
            },
            Header::IceCandidate => Record::IceCandidate {
                target: r.ustring()?,
                candidate: r.ustring()?,
                sdp_mline_index: r.varint()?,
                sdp_mid: r.ustring()?,
            },
            Header::WhitelistUser => Record::WhitelistUser {
                target: r.ustring()?,
            },
            Header::ModElected => Record::ModElected {
                target: r.ustring()?,
            },
            Header::SetLockdownLevel => Record::SetLockdownLevel { level: r.varint()? },
            Header::SetModerationTable => {
                let key = r.ustring()?;
                let n = r.varint()?;
                if n > MAX_TABLE_ENTRIES {
                    return Err(BexError::TableTooLarge);
                }
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    entries.push(r.ustring()?);
                }
                Record::SetModerationTable { key, entries }
            }
        };

        records.push(record);
    }

    Ok(records)
}

/// Encode records into a BEX message. Output always begins with the magic.
pub fn encode(records: &[Record]) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes(&BEX_MAGIC);
    w.varint(records.len() as u64);

    for record in records {
        w.varint(record.header() as u64);

        match record {
            Record::Composing
            | Record::Paused
            | Record::FlagMeAsBot
            | Record::StatusOnline
            | Record::StatusAway
            | Record::RemoveDeadUsers
            | Record::RtcSignalCapability => {}
            Record::SetColor { rgb } => w.bytes(rgb),
            Record::FileAttachment(f) => {
                w.varint(f.prefix_size);
                w.bytes(&f.key);
                w.bytes(&f.nonce);
                w.ustring(&f.mime);
                w.bytes(f.uuid.as_bytes());
            }
            Record::TextMessage { kind, message } => {
                w.ustring(kind);
                w.ustring(message);
            }
            Record::RtcOffer { target, sdp } | Record::RtcAnswer { target, sdp } => {
                w.ustring(target);
                w.ustring(sdp);
            }
            Record::IceCandidate {
                target,
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                w.ustring(target);
                w.ustring(candidate);
                w.varint(*sdp_mline_index);
                w.ustring(sdp_mid);
            }
            Record::WhitelistUser { target } | Record::ModElected { target } => {
                w.ustring(target);
            }
            Record::SetLockdownLevel { level } => w.varint(*level),
            Record::SetModerationTable { key, entries } => {
                w.ustring(key);
                w.varint(entries.len() as u64);
                for entry in entries {
                    w.ustring(entry);
                }
            }
        }
    }

    w.buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_prefix() {
        let out = encode(&[Record::Composing]);
        assert_eq!(&out[..3], &BEX_MAGIC);
    }

    #[test]
    fn color_parse_render() {
        assert_eq!(parse_color("#ff69b4"), Some([0xff, 0x69, 0xb4]));
        assert_eq!(parse_color("#FF69B4"), Some([0xff, 0x69, 0xb4]));
        assert_eq!(parse_color("ff69b4"), None);
        assert_eq!(parse_color("#ff69b"), None);
        assert_eq!(render_color([0xff, 0x69, 0xb4]), "#FF69B4");
        assert_eq!(render_color([0x04, 0x05, 0x06]), "#040506");
    }

    #[test]
    fn not_bex() {
        assert_eq!(decode(b"hello"), Err(BexError::NotBex));
        assert_eq!(decode(&[]), Err(BexError::NotBex));
        assert!(!is_bex(b"he"));
        assert!(is_bex(&[0x04, 0x45, 0xff, 0x00]));
    }

    #[test]
    fn too_many_records() {
        let mut buf = BEX_MAGIC.to_vec();
        buf.push(9);
        assert_eq!(decode(&buf), Err(BexError::TooMany));
    }

    #[test]
    fn truncated_does_not_panic() {
        let full = encode(&[Record::TextMessage {
            kind: "status".into(),
            message: "pondering".into(),
        }]);
        for cut in 3..full.len() {
            // every proper prefix must fail cleanly
            assert_eq!(decode(&full[..cut]), Err(BexError::Truncated));
        }
    }

    #[test]
    fn unknown_header_is_skipped() {
        let mut buf = BEX_MAGIC.to_vec();
        buf.push(2); // two records
        buf.push(20); // reserved header, no body
        buf.push(4); // Composing
        let records = decode(&buf).unwrap();
        assert_eq!(records, vec![Record::Composing]);

        // reserved values below and above the assigned ranges too
        for reserved in [2u8, 3, 34] {
            let mut buf = BEX_MAGIC.to_vec();
            buf.push(2);
            buf.push(reserved);
            buf.push(5); // Paused
            assert_eq!(decode(&buf).unwrap(), vec![Record::Paused]);
        }
    }

    #[test]
    fn table_cap() {
        let mut buf = BEX_MAGIC.to_vec();
        buf.push(1);
        buf.push(13); // SetModerationTable
        buf.push(1); // key "k"
        buf.push(b'k');
        // 513 entries as two-byte LEB128
        buf.push(0x81);
        buf.push(0x04);
        assert_eq!(decode(&buf), Err(BexError::TableTooLarge));
    }

    #[test]
    fn round_trip_all_bodies() {
        let records = vec![
            Record::SetColor {
                rgb: [0x41, 0x3e, 0xd1],
            },
            Record::FileAttachment(FileRecord {
                prefix_size: 9001,
                key: [7u8; 32],
                nonce: [9u8; 24],
                mime: "image/png".into(),
                uuid: Uuid::from_bytes([3u8; 16]),
            }),
            Record::IceCandidate {
                target: "bob".into(),
                candidate: "candidate:0 1 UDP".into(),
                sdp_mline_index: 2,
                sdp_mid: "audio".into(),
            },
            Record::SetModerationTable {
                key: "bans".into(),
                entries: vec!["AAAA".into(), "BBBB".into()],
            },
            Record::FlagMeAsBot,
        ];
        assert_eq!(decode(&encode(&records)).unwrap(), records);
    }

    #[test]
    fn varint_multibyte() {
        let records = vec![Record::SetLockdownLevel { level: 300 }];
        let encoded = encode(&records);
        // 300 = 0xAC 0x02 in LEB128
        assert!(encoded.windows(2).any(|w| w == [0xac, 0x02]));
        assert_eq!(decode(&encoded).unwrap(), records);
    }
}
