//! Property-based tests for document merge laws.
//!
//! Replicas apply arbitrary put/delete sequences concurrently; merging their
//! documents in any order must produce the same state.

use proptest::prelude::*;
use serde_json::json;
use soulstore_crdt::Document;
use soulstore_types::PeerId;

#[derive(Debug, Clone)]
enum Edit {
    Put(u8, i64),
    Delete(u8),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0u8..6, any::<i64>()).prop_map(|(k, v)| Edit::Put(k, v)),
        (0u8..6).prop_map(Edit::Delete),
    ]
}

fn apply(doc: &Document, peer: PeerId, edits: &[Edit]) -> Document {
    edits.iter().fold(doc.clone(), |d, edit| {
        d.change(peer, |c| match edit {
            Edit::Put(k, v) => c.put(format!("k{k}"), json!(v)),
            Edit::Delete(k) => c.delete(format!("k{k}")),
        })
    })
}

proptest! {
    #[test]
    fn merge_is_commutative(
        e1 in prop::collection::vec(edit_strategy(), 0..12),
        e2 in prop::collection::vec(edit_strategy(), 0..12),
    ) {
        let base = Document::init();
        let a = apply(&base, PeerId::new(), &e1);
        let b = apply(&base, PeerId::new(), &e2);
        prop_assert!(a.merge(&b).equals(&b.merge(&a)));
    }

    #[test]
    fn merge_is_associative(
        e1 in prop::collection::vec(edit_strategy(), 0..8),
        e2 in prop::collection::vec(edit_strategy(), 0..8),
        e3 in prop::collection::vec(edit_strategy(), 0..8),
    ) {
        let base = Document::init();
        let a = apply(&base, PeerId::new(), &e1);
        let b = apply(&base, PeerId::new(), &e2);
        let c = apply(&base, PeerId::new(), &e3);
        prop_assert!(a.merge(&b).merge(&c).equals(&a.merge(&b.merge(&c))));
    }

    #[test]
    fn merge_is_idempotent(e1 in prop::collection::vec(edit_strategy(), 0..12)) {
        let a = apply(&Document::init(), PeerId::new(), &e1);
        prop_assert!(a.merge(&a).equals(&a));
    }

    #[test]
    fn merge_keeps_every_key(
        e1 in prop::collection::vec(edit_strategy(), 0..12),
        e2 in prop::collection::vec(edit_strategy(), 0..12),
    ) {
        let base = Document::init();
        let a = apply(&base, PeerId::new(), &e1);
        let b = apply(&base, PeerId::new(), &e2);
        let merged = a.merge(&b);
        for key in a.keys().chain(b.keys()) {
            prop_assert!(merged.get(key).is_some());
        }
    }
}
