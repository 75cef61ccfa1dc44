use soulstore_types::{PeerId, Soul};
use std::collections::HashSet;
use std::str::FromStr;

// ── Soul ─────────────────────────────────────────────────────────

#[test]
fn random_souls_are_unique() {
    let a = Soul::random();
    let b = Soul::random();
    assert_ne!(a, b);
}

#[test]
fn random_soul_has_no_hyphens() {
    let soul = Soul::random();
    assert_eq!(soul.as_str().len(), 32);
    assert!(!soul.as_str().contains('-'));
}

#[test]
fn parse_accepts_derived_souls() {
    let soul = Soul::parse("users/ada").unwrap();
    assert_eq!(soul.as_str(), "users/ada");
    assert_eq!(soul.to_string(), "users/ada");
}

#[test]
fn parse_rejects_empty_and_whitespace() {
    assert!(Soul::parse("").is_err());
    assert!(Soul::parse("has space").is_err());
    assert!(Soul::from_str("tab\there").is_err());
}

#[test]
fn soul_serializes_transparently() {
    let soul = Soul::from("S1");
    let json = serde_json::to_string(&soul).unwrap();
    assert_eq!(json, "\"S1\"");
    let back: Soul = serde_json::from_str(&json).unwrap();
    assert_eq!(back, soul);
}

#[test]
fn soul_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(Soul::from("a"));
    set.insert(Soul::from("a"));
    set.insert(Soul::from("b"));
    assert_eq!(set.len(), 2);
}

// ── PeerId ───────────────────────────────────────────────────────

#[test]
fn peer_id_new_is_unique() {
    assert_ne!(PeerId::new(), PeerId::new());
}

#[test]
fn peer_id_display_and_parse() {
    let id = PeerId::new();
    let parsed = PeerId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn peer_id_parse_invalid() {
    assert!(PeerId::parse("not-a-uuid").is_err());
    assert!(PeerId::from_str("garbage").is_err());
}

#[test]
fn peer_id_from_uuid_roundtrip() {
    let uuid = uuid::Uuid::now_v7();
    assert_eq!(PeerId::from_uuid(uuid).as_uuid(), uuid);
}
