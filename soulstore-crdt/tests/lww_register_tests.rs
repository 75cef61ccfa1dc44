use soulstore_crdt::{Dot, LWWRegister};
use soulstore_types::{HybridTimestamp, PeerId};

fn reg(value: &'static str, wall: u64, peer: PeerId, counter: u64) -> LWWRegister<&'static str> {
    LWWRegister::new(value, HybridTimestamp::new(wall, 0), Dot::new(peer, counter))
}

#[test]
fn accessors() {
    let peer = PeerId::new();
    let r = reg("hi", 10, peer, 1);
    assert_eq!(*r.value(), "hi");
    assert_eq!(r.timestamp(), HybridTimestamp::new(10, 0));
    assert_eq!(r.peer_id(), peer);
    assert_eq!(r.dot(), Dot::new(peer, 1));
}

#[test]
fn newer_timestamp_wins() {
    let peer = PeerId::new();
    let old = reg("old", 100, peer, 1);
    let new = reg("new", 200, peer, 2);
    assert!(new.wins_over(&old));
    assert_eq!(*old.merged(&new).value(), "new");
    assert_eq!(*new.merged(&old).value(), "new");
}

#[test]
fn peer_breaks_timestamp_tie() {
    let (p1, p2) = (PeerId::new(), PeerId::new());
    let a = reg("a", 100, p1, 1);
    let b = reg("b", 100, p2, 1);
    let expected = if p1 > p2 { "a" } else { "b" };
    assert_eq!(*a.merged(&b).value(), expected);
    assert_eq!(*b.merged(&a).value(), expected);
}

#[test]
fn merge_is_idempotent() {
    let r = reg("x", 5, PeerId::new(), 1);
    assert_eq!(r.merged(&r), r);
}
