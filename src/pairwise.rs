//! Seam for the external deniable-authentication library used on the
//! private (direct message) channel.
//!
//! The group channel never touches this; only one-to-one traffic runs
//! through a `PairwiseSession`. This crate does not reimplement the
//! protocol: consumers plug an implementation in via
//! [`crate::conn::Options::pairwise`]. Without one, private messages pass
//! through as opaque text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PairwiseError {
    #[error("pairwise session error: {0}")]
    Session(String),
}

/// Socialist-millionaire verification progress, surfaced as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    /// The peer started verification and asks `question`.
    Question(String),
    Success,
    Failure,
}

/// One established (or establishing) deniable channel with a single peer.
///
/// `send`/`receive` return wire fragments to transmit verbatim on the
/// private channel; the implementation handles its own handshaking.
pub trait PairwiseSession: Send {
    /// Encrypt `plain` for the peer. May return several wire fragments.
    fn send(&mut self, plain: &[u8]) -> Result<Vec<String>, PairwiseError>;

    /// Feed one inbound wire fragment. Returns decrypted plaintext (if the
    /// fragment completed a message) and any fragments to send back.
    fn receive(&mut self, wire: &str) -> Result<(Option<String>, Vec<String>), PairwiseError>;

    /// Begin socialist-millionaire verification with a question.
    fn smp_start(&mut self, question: &str, answer: &str) -> Result<Vec<String>, PairwiseError>;

    /// Answer a pending verification question.
    fn smp_answer(&mut self, answer: &str) -> Result<Vec<String>, PairwiseError>;

    /// Drain the next pending verification event, if any.
    fn poll_event(&mut self) -> Option<SmpEvent>;

    /// True once the channel is encrypted end to end.
    fn is_established(&self) -> bool;
}

/// Supplies the external library: long-term key generation plus one
/// session per peer. The key string round-trips through the storage shim
/// under the `"otr"` key.
pub trait PairwiseProvider: Send + Sync {
    /// Generate fresh long-term key material, serialized for storage.
    fn generate_key(&self) -> String;

    /// Build a session for one peer from the persisted key material.
    fn session(&self, key: &str) -> Box<dyn PairwiseSession>;
}

/// Normalize a verification answer and bind it to both parties' group
/// fingerprints, so the shared secret covers the keys being verified.
/// `asking` orders the fingerprints by who initiated.
pub fn prepare_answer(answer: &str, asking: bool, my_fp: &str, peer_fp: &str) -> String {
    let mut normalized: String = answer
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '\'' | '"' | ';' | '?' | '!'))
        .collect();

    if !peer_fp.is_empty() {
        let (first, second) = if asking {
            (my_fp, peer_fp)
        } else {
            (peer_fp, my_fp)
        };
        normalized.push(';');
        normalized.push_str(first);
        normalized.push(';');
        normalized.push_str(second);
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_normalization() {
        assert_eq!(
            prepare_answer("It's A Secret!", true, "AA", "BB"),
            "its a secret;AA;BB"
        );
        // responder reverses the fingerprint order
        assert_eq!(
            prepare_answer("Its a secret", false, "AA", "BB"),
            "its a secret;BB;AA"
        );
        // without an established peer fingerprint, only normalization applies
        assert_eq!(prepare_answer("Hello?", true, "AA", ""), "hello");
    }
}
