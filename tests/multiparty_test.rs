//! Multiparty session scenario tests.
//!
//! Run with: cargo test --test multiparty_test

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use conclave::{Received, Session};

fn established(names: &[&str]) -> Vec<Session> {
    let mut sessions: Vec<Session> = names.iter().map(|n| Session::new(n, None)).collect();
    let announcements: Vec<(String, Vec<u8>)> = sessions
        .iter()
        .map(|s| (s.nick().to_string(), s.public_key_message().unwrap()))
        .collect();
    for session in &mut sessions {
        for (nick, wire) in &announcements {
            if nick != session.nick() {
                session
                    .receive(nick, std::str::from_utf8(wire).unwrap())
                    .unwrap();
            }
        }
    }
    sessions
}

fn plaintext(received: Received) -> Vec<u8> {
    match received {
        Received::Plaintext(p) => p,
        other => panic!("expected plaintext, got {other:?}"),
    }
}

#[test]
fn every_roster_member_decrypts_the_same_bytes() {
    let mut sessions = established(&["alice", "bob", "carol", "dave"]);
    let wire = sessions[0].send(b"meeting at nine").unwrap();
    let wire = std::str::from_utf8(&wire).unwrap().to_string();

    for receiver in &mut sessions[1..] {
        let got = plaintext(receiver.receive("alice", &wire).unwrap());
        assert_eq!(got, b"meeting at nine");
    }
}

#[test]
fn two_party_exchange_grows_iv_sets() {
    let mut sessions = established(&["alice", "bob"]);
    assert_eq!(sessions[0].used_iv_count(), 0);

    let wire = sessions[0].send(b"hello").unwrap();
    let wire = std::str::from_utf8(&wire).unwrap().to_string();
    assert_eq!(sessions[0].used_iv_count(), 1);

    let got = plaintext(sessions[1].receive("alice", &wire).unwrap());
    assert_eq!(got, b"hello");
    assert_eq!(sessions[1].used_iv_count(), 1);
}

#[test]
fn replayed_wire_is_rejected_once_accepted() {
    let mut sessions = established(&["alice", "bob"]);
    let first = sessions[0].send(b"one").unwrap();
    let first = std::str::from_utf8(&first).unwrap().to_string();

    assert_eq!(plaintext(sessions[1].receive("alice", &first).unwrap()), b"one");
    assert!(matches!(
        sessions[1].receive("alice", &first),
        Err(conclave::SessionError::ReplayDetected)
    ));
}

#[test]
fn recipient_set_tampering_is_detected_by_everyone() {
    let mut sessions = established(&["alice", "bob", "carol"]);
    let wire = sessions[0].send(b"hi").unwrap();
    let mut envelope: serde_json::Value = serde_json::from_slice(&wire).unwrap();
    envelope["text"].as_object_mut().unwrap().remove("carol");
    let tampered = serde_json::to_string(&envelope).unwrap();

    assert!(matches!(
        sessions[1].receive("alice", &tampered),
        Err(conclave::SessionError::HmacFailure)
    ));
}

#[test]
fn inconsistent_plaintexts_cannot_share_a_tag() {
    // a malicious sender splices bob's bundle from message one with
    // carol's bundle (and tag) from message two
    let mut sessions = established(&["alice", "bob", "carol"]);
    let one = sessions[0].send(b"for bob").unwrap();
    let two = sessions[0].send(b"for carol").unwrap();

    let one: serde_json::Value = serde_json::from_slice(&one).unwrap();
    let mut spliced: serde_json::Value = serde_json::from_slice(&two).unwrap();
    spliced["text"]["bob"] = one["text"]["bob"].clone();

    let spliced = serde_json::to_string(&spliced).unwrap();
    assert!(sessions[1].receive("alice", &spliced).is_err());
}

#[test]
fn fingerprints_are_deterministic_across_restarts() {
    let original = Session::new("alice", None);
    let secret: [u8; 32] = BASE64
        .decode(original.save_profile())
        .unwrap()
        .try_into()
        .unwrap();

    let restored = Session::new("alice", Some(secret));
    assert_eq!(original.fingerprint(None), restored.fingerprint(None));
    assert_eq!(original.fingerprint(None).unwrap().len(), 40);
}

#[test]
fn peers_agree_on_fingerprints() {
    let sessions = established(&["alice", "bob"]);
    assert_eq!(
        sessions[0].fingerprint(None),
        sessions[1].fingerprint(Some("alice"))
    );
    assert_eq!(
        sessions[1].fingerprint(None),
        sessions[0].fingerprint(Some("bob"))
    );
    assert_eq!(
        sessions[0].names_by_fingerprint(&sessions[1].fingerprint(None).unwrap()),
        vec!["bob".to_string()]
    );
}

#[test]
fn departed_peers_are_dropped_from_the_bundle() {
    let mut sessions = established(&["alice", "bob", "carol"]);
    sessions[0].destroy_user("carol");

    let wire = sessions[0].send(b"smaller room").unwrap();
    let envelope: serde_json::Value = serde_json::from_slice(&wire).unwrap();
    assert!(envelope["text"].get("bob").is_some());
    assert!(envelope["text"].get("carol").is_none());
    assert_eq!(sessions[0].sorted_names(), vec!["bob".to_string()]);
}
