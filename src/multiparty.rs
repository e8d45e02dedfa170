//! Multiparty cryptographic session.
//!
//! Each room owns one `Session`. It keeps a pairwise shared secret with
//! every cooperating peer (SHA-512 of the X25519 agreement, split into a
//! 32-byte message key and a 32-byte MAC key), encrypts each outbound
//! plaintext once per recipient under AES-256-CTR, authenticates every
//! recipient's ciphertext with HMAC-SHA-512 over the whole sorted bundle,
//! and cross-binds the bundle with a collective message tag so recipients
//! can detect tampering with the recipient set.
//!
//! The session is a plain mutable value: the owning room task serializes
//! all access, so `send` and `receive` are never interleaved.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Default cap on the base64 length of a single per-recipient ciphertext.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 6000;

/// Random bytes appended to every plaintext before encryption. Stripped on
/// receive; they make the collective tag unpredictable for low-entropy
/// plaintexts.
const TAIL_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("hmac verification failed")]
    HmacFailure,
    #[error("collective message tag mismatch")]
    TagMismatch,
    #[error("iv reuse detected, possible replay attack")]
    ReplayDetected,
    #[error("peer attempted to change an established public key")]
    InvalidKeyChange,
    #[error("plaintext shorter than the random tail")]
    Truncated,
    #[error("per-recipient ciphertext exceeds {0} bytes, refusing to decrypt")]
    MessageTooLarge(usize),
    #[error("message is not addressed to this client")]
    NotAddressed,
    #[error("sender has no established session key")]
    UnknownSender,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Per-peer key state.
#[derive(Clone)]
pub struct Buddy {
    pub crypto_enabled: bool,
    pub public_key: [u8; 32],
    shared: Option<SharedKeys>,
}

#[derive(Clone)]
struct SharedKeys {
    msg_key: [u8; 32],
    mac_key: [u8; 32],
}

/// Outcome of feeding one inbound wire message to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Nothing to act on (own echo, duplicate key, unknown envelope type).
    None,
    /// The sender just became a cryptographically established peer.
    NewPeer(String),
    /// A decrypted group plaintext, random tail already stripped.
    Plaintext(Vec<u8>),
    /// A wire message the caller should transmit (answer to a key request).
    Reply(Vec<u8>),
}

#[derive(Serialize)]
struct KeyExMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Serialize, Deserialize)]
struct MessageEnvelope {
    #[serde(rename = "type")]
    kind: String,
    text: BTreeMap<String, Bundle>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    tag: String,
}

#[derive(Serialize, Deserialize, Default, Clone)]
struct Bundle {
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    iv: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hmac: String,
}

/// Per-room multiparty state: identity, peers, replay cache.
pub struct Session {
    nick: String,
    secret: StaticSecret,
    public: PublicKey,
    buddies: BTreeMap<String, Buddy>,
    used_ivs: HashSet<String>,
    blacklist: HashSet<String>,
    max_message_size: usize,
}

impl Session {
    /// Create a session for `nick`. `profile` restores a persisted identity
    /// secret; otherwise a fresh one is generated.
    pub fn new(nick: &str, profile: Option<[u8; 32]>) -> Self {
        let secret = match profile {
            Some(bytes) => StaticSecret::from(bytes),
            None => StaticSecret::random_from_rng(OsRng),
        };
        let public = PublicKey::from(&secret);
        Session {
            nick: nick.to_string(),
            secret,
            public,
            buddies: BTreeMap::new(),
            used_ivs: HashSet::new(),
            blacklist: HashSet::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Base64 identity secret, suitable for the storage shim.
    pub fn save_profile(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    /// Wire message announcing our public key.
    pub fn public_key_message(&self) -> Result<Vec<u8>, SessionError> {
        let encoded = BASE64.encode(self.public.as_bytes());
        let msg = KeyExMessage {
            kind: "public_key",
            text: &encoded,
        };
        Ok(serde_json::to_vec(&msg)?)
    }

    /// Wire message asking `target` (or everyone, when empty) to announce
    /// their public key.
    pub fn public_key_request(&self, target: &str) -> Result<Vec<u8>, SessionError> {
        let msg = KeyExMessage {
            kind: "public_key_request",
            text: target,
        };
        Ok(serde_json::to_vec(&msg)?)
    }

    pub fn blacklist_user(&mut self, nick: &str) {
        self.blacklist.insert(nick.to_string());
    }

    pub fn unblacklist_user(&mut self, nick: &str) {
        self.blacklist.remove(nick);
    }

    pub fn clear_blacklist(&mut self) {
        self.blacklist.clear();
    }

    /// Forget a peer entirely. Their next key announcement is treated as a
    /// fresh introduction.
    pub fn destroy_user(&mut self, nick: &str) {
        self.buddies.remove(nick);
    }

    /// True once a pairwise key has been established with `nick`.
    pub fn is_session_initialized(&self, nick: &str) -> bool {
        self.buddies
            .get(nick)
            .map(|b| b.shared.is_some())
            .unwrap_or(false)
    }

    /// All known peer nicks, lexicographically sorted.
    pub fn sorted_names(&self) -> Vec<String> {
        self.buddies.keys().cloned().collect()
    }

    pub fn used_iv_count(&self) -> usize {
        self.used_ivs.len()
    }

    /// Fingerprint of a peer's key, or of our own when `nick` is `None`.
    /// Uppercase hex of SHA-512, truncated to 40 characters.
    pub fn fingerprint(&self, nick: Option<&str>) -> Option<String> {
        let key = match nick {
            None => self.public.to_bytes(),
            Some(n) => self.buddies.get(n)?.public_key,
        };
        let digest = Sha512::digest(key);
        Some(hex::encode_upper(digest)[..40].to_string())
    }

    /// Fingerprint rendered in groups of eight for human comparison.
    pub fn fingerprint_spaced(&self, nick: Option<&str>) -> Option<String> {
        let fp = self.fingerprint(nick)?;
        let spaced = fp
            .as_bytes()
            .chunks(8)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        Some(spaced)
    }

    /// Peers whose key matches `fp`, sorted.
    pub fn names_by_fingerprint(&self, fp: &str) -> Vec<String> {
        self.buddies
            .keys()
            .filter(|nick| self.fingerprint(Some(nick.as_str())).as_deref() == Some(fp))
            .cloned()
            .collect()
    }

    /// Encrypt `plaintext` to every established, non-blacklisted peer and
    /// return the single wire message carrying the whole recipient bundle.
    pub fn send(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut padded = plaintext.to_vec();
        let mut tail = [0u8; TAIL_SIZE];
        OsRng.fill_bytes(&mut tail);
        padded.extend_from_slice(&tail);

        // BTreeMap iteration gives the lexicographic recipient order the
        // collective tag depends on.
        let recipients: Vec<(String, SharedKeys)> = self
            .buddies
            .iter()
            .filter(|(nick, b)| b.crypto_enabled && !self.blacklist.contains(nick.as_str()))
            .filter_map(|(nick, b)| b.shared.clone().map(|s| (nick.clone(), s)))
            .collect();

        let mut bundles: BTreeMap<String, Bundle> = BTreeMap::new();
        let mut mac_input = Vec::new();

        for (nick, keys) in &recipients {
            let mut iv = new_iv();
            if self.used_ivs.contains(&iv) {
                iv = new_iv();
            }
            self.used_ivs.insert(iv.clone());

            let mut ciphertext = padded.clone();
            apply_ctr(&keys.msg_key, &fix_iv(&iv), &mut ciphertext);

            mac_input.extend_from_slice(&ciphertext);
            // the raw IV bytes, not their base64 form
            mac_input.extend_from_slice(&fix_iv(&iv)[..12]);

            bundles.insert(
                nick.clone(),
                Bundle {
                    message: BASE64.encode(&ciphertext),
                    iv,
                    hmac: String::new(),
                },
            );
        }

        let mut tag_input = padded;
        for (nick, keys) in &recipients {
            let mac = hmac_sha512(&keys.mac_key, &mac_input);
            tag_input.extend_from_slice(&mac);
            if let Some(bundle) = bundles.get_mut(nick) {
                bundle.hmac = BASE64.encode(mac);
            }
        }

        let envelope = MessageEnvelope {
            kind: "message".to_string(),
            text: bundles,
            tag: message_tag(&tag_input),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Feed one inbound wire message from `sender` to the session.
    pub fn receive(&mut self, sender: &str, wire: &str) -> Result<Received, SessionError> {
        if sender == self.nick {
            return Ok(Received::None);
        }

        let value: serde_json::Value = serde_json::from_str(wire)?;
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match kind {
            "public_key" => {
                let text = value.get("text").and_then(|t| t.as_str()).unwrap_or("");
                self.receive_public_key(sender, text)
            }
            "public_key_request" => {
                let text = value.get("text").and_then(|t| t.as_str()).unwrap_or("");
                if text.is_empty() || text == self.nick {
                    Ok(Received::Reply(self.public_key_message()?))
                } else {
                    Ok(Received::None)
                }
            }
            "message" => {
                let envelope: MessageEnvelope = serde_json::from_value(value)?;
                self.receive_encrypted(sender, &envelope)
            }
            other => {
                debug!(kind = other, sender, "ignoring unknown multiparty envelope");
                Ok(Received::None)
            }
        }
    }

    fn receive_public_key(&mut self, sender: &str, text: &str) -> Result<Received, SessionError> {
        if text.is_empty() {
            return Err(SessionError::Malformed("empty public key".into()));
        }

        let decoded = BASE64.decode(text)?;
        let peer_pk: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::Malformed("public key is not 32 bytes".into()))?;

        if let Some(buddy) = self.buddies.get(sender) {
            if buddy.crypto_enabled {
                if buddy.public_key == peer_pk {
                    // duplicate announcement of the same key: no-op, no event
                    return Ok(Received::None);
                }
                return Err(SessionError::InvalidKeyChange);
            }
        }

        let shared_point = self.secret.diffie_hellman(&PublicKey::from(peer_pk));
        let digest = Sha512::digest(shared_point.as_bytes());
        let mut msg_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        msg_key.copy_from_slice(&digest[..32]);
        mac_key.copy_from_slice(&digest[32..64]);

        self.buddies.insert(
            sender.to_string(),
            Buddy {
                crypto_enabled: true,
                public_key: peer_pk,
                shared: Some(SharedKeys { msg_key, mac_key }),
            },
        );

        Ok(Received::NewPeer(sender.to_string()))
    }

    fn receive_encrypted(
        &mut self,
        sender: &str,
        envelope: &MessageEnvelope,
    ) -> Result<Received, SessionError> {
        let mine = envelope
            .text
            .get(&self.nick)
            .ok_or(SessionError::NotAddressed)?;
        if mine.message.is_empty() || mine.iv.is_empty() || mine.hmac.is_empty() {
            return Err(SessionError::NotAddressed);
        }
        if mine.message.len() > self.max_message_size {
            return Err(SessionError::MessageTooLarge(self.max_message_size));
        }

        let sender_keys = self
            .buddies
            .get(sender)
            .and_then(|b| b.shared.clone())
            .ok_or(SessionError::UnknownSender)?;

        // A recipient the sender knows about but did not (fully) address is
        // "missing"; everyone else named in the bundle participates in the
        // HMAC and tag reconstruction, in sorted order.
        let missing: HashSet<&String> = self
            .buddies
            .keys()
            .filter(|nick| {
                match envelope.text.get(*nick) {
                    None => true,
                    Some(b) => b.message.is_empty() || b.iv.is_empty() || b.hmac.is_empty(),
                }
            })
            .collect();

        let present: Vec<(&String, &Bundle)> = envelope
            .text
            .iter()
            .filter(|(nick, _)| !missing.contains(nick))
            .collect();

        let mut mac_input = Vec::new();
        for (_, bundle) in &present {
            mac_input.extend_from_slice(&BASE64.decode(&bundle.message)?);
            mac_input.extend_from_slice(&BASE64.decode(&bundle.iv)?);
        }

        let mut mac = HmacSha512::new_from_slice(&sender_keys.mac_key)
            .expect("hmac accepts any key length");
        mac.update(&mac_input);
        let claimed = BASE64.decode(&mine.hmac)?;
        if mac.verify_slice(&claimed).is_err() {
            return Err(SessionError::HmacFailure);
        }

        if self.used_ivs.contains(&mine.iv) {
            return Err(SessionError::ReplayDetected);
        }
        self.used_ivs.insert(mine.iv.clone());

        let mut plaintext = BASE64.decode(&mine.message)?;
        apply_ctr(&sender_keys.msg_key, &fix_iv(&mine.iv), &mut plaintext);

        let mut tag_input = plaintext.clone();
        for (_, bundle) in &present {
            if let Ok(raw) = BASE64.decode(&bundle.hmac) {
                tag_input.extend_from_slice(&raw);
            }
        }
        if message_tag(&tag_input) != envelope.tag {
            return Err(SessionError::TagMismatch);
        }

        if plaintext.len() < TAIL_SIZE {
            return Err(SessionError::Truncated);
        }
        plaintext.truncate(plaintext.len() - TAIL_SIZE);
        Ok(Received::Plaintext(plaintext))
    }
}

/// Collective tag: base64 of eight folded SHA-512 iterations.
pub fn message_tag(input: &[u8]) -> String {
    let mut digest = input.to_vec();
    for _ in 0..8 {
        digest = Sha512::digest(&digest).to_vec();
    }
    BASE64.encode(digest)
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn apply_ctr(key: &[u8; 32], iv: &[u8; 16], buf: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Fresh 12-byte IV, base64-encoded as it travels on the wire.
fn new_iv() -> String {
    let mut buf = [0u8; 12];
    OsRng.fill_bytes(&mut buf);
    BASE64.encode(buf)
}

/// Expand a wire IV into the 16-byte CTR counter block: 12 IV bytes plus a
/// zero 32-bit counter. Undecodable or short IVs yield an all-zero block;
/// the HMAC check has already rejected genuine tampering by then.
fn fix_iv(s: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    match BASE64.decode(s) {
        Ok(raw) if raw.len() >= 12 => out[..12].copy_from_slice(&raw[..12]),
        _ => {}
    }
    out
}
