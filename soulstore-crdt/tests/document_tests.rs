use pretty_assertions::assert_eq;
use serde_json::json;
use soulstore_crdt::Document;
use soulstore_types::PeerId;

#[test]
fn change_returns_new_document() {
    let peer = PeerId::new();
    let base = Document::init();
    let next = base.change(peer, |c| c.put("name", json!("Ada")));
    assert!(base.get("name").is_none());
    assert_eq!(next.get("name"), Some(&json!("Ada")));
    assert_eq!(next.get_heads().len(), 1);
    assert_eq!(next.get_heads()[0].counter, 1);
}

#[test]
fn deleted_is_distinguishable_from_never_set() {
    let peer = PeerId::new();
    let doc = Document::init()
        .change(peer, |c| c.put("a", json!(1)))
        .change(peer, |c| c.delete("a"));
    assert_eq!(doc.get("a"), Some(&serde_json::Value::Null));
    assert_eq!(doc.get("b"), None);
    assert_eq!(doc.live_entries().count(), 0);
}

#[test]
fn disjoint_edits_converge_to_union() {
    let (p1, p2) = (PeerId::new(), PeerId::new());
    let base = Document::init().change(p1, |c| c.put_meta("o", json!("Person")));
    let a = base.change(p1, |c| c.put("name", json!("Ada")));
    let b = base.change(p2, |c| c.put("age", json!(36)));

    let ab = a.merge(&b);
    let ba = b.merge(&a);
    assert!(ab.equals(&ba));
    assert_eq!(ab.get("name"), Some(&json!("Ada")));
    assert_eq!(ab.get("age"), Some(&json!(36)));
    assert!(ab.get_conflicts("name").is_none());
}

#[test]
fn causally_later_write_wins_regardless_of_peer_order() {
    let (p1, p2) = (PeerId::new(), PeerId::new());
    let a = Document::init().change(p1, |c| c.put("k", json!("first")));
    // b has seen a's write and overwrites it.
    let b = a.change(p2, |c| c.put("k", json!("second")));

    assert_eq!(a.merge(&b).get("k"), Some(&json!("second")));
    assert_eq!(b.merge(&a).get("k"), Some(&json!("second")));
    assert!(a.merge(&b).get_conflicts("k").is_none());
}

#[test]
fn concurrent_writes_are_reported_as_conflicts() {
    let (p1, p2) = (PeerId::new(), PeerId::new());
    let a = Document::init().change(p1, |c| c.put("k", json!("left")));
    let b = Document::init().change(p2, |c| c.put("k", json!("right")));

    let ab = a.merge(&b);
    let ba = b.merge(&a);
    assert_eq!(ab.get("k"), ba.get("k"));

    let conflicts = ab.get_conflicts("k").unwrap();
    assert_eq!(conflicts.len(), 2);
    assert_eq!(conflicts.get(&p1.to_string()), Some(&json!("left")));
    assert_eq!(conflicts.get(&p2.to_string()), Some(&json!("right")));
}

#[test]
fn merge_is_idempotent() {
    let peer = PeerId::new();
    let doc = Document::init().change(peer, |c| {
        c.put("a", json!(1));
        c.put_meta("o", json!("Thing"));
    });
    assert!(doc.merge(&doc).equals(&doc));
}

#[test]
fn meta_registers_merge_and_hide_deleted() {
    let (p1, p2) = (PeerId::new(), PeerId::new());
    let a = Document::init().change(p1, |c| c.put_meta("o", json!("Object")));
    let b = a.change(p2, |c| c.delete_meta("o"));
    let merged = a.merge(&b);
    assert_eq!(merged.get_meta("o"), None);
    assert_eq!(merged.live_meta().count(), 0);
}

#[test]
fn list_values_follow_index_order_and_length() {
    let peer = PeerId::new();
    let doc = Document::init().change(peer, |c| {
        c.put("2", json!("c"));
        c.put("0", json!("a"));
        c.put("1", json!("b"));
        c.put("3", json!("stale"));
        c.put_meta("len", json!(3));
    });
    assert_eq!(doc.list_values(), vec![&json!("a"), &json!("b"), &json!("c")]);
}

#[test]
fn save_load_preserves_heads_and_values() {
    let peer = PeerId::new();
    let doc = Document::init()
        .change(peer, |c| c.put("name", json!("Ada")))
        .change(peer, |c| c.put_meta("o", json!("Person")));
    let bytes = doc.save().unwrap();
    let loaded = Document::load(&bytes).unwrap();
    assert!(loaded.equals(&doc));
    assert_eq!(loaded.get_heads(), doc.get_heads());
    assert_eq!(loaded.save().unwrap(), bytes);
}

#[test]
fn load_rejects_garbage() {
    assert!(Document::load(b"not a document").is_err());
}
