use soulstore_types::{AttributeChange, EntityEvent, EventKind, Soul, Value};
use std::collections::BTreeMap;

#[test]
fn conversions_from_primitives() {
    assert_eq!(Value::from("a"), Value::Text("a".into()));
    assert_eq!(Value::from(2.5), Value::Number(2.5));
    assert_eq!(Value::from(3i64), Value::Number(3.0));
    assert_eq!(Value::from(true), Value::Bool(true));
    assert_eq!(Value::from(None::<&str>), Value::Null);
    assert_eq!(Value::from(Soul::from("S1")), Value::Entity(Soul::from("S1")));
}

#[test]
fn accessors_match_variant() {
    let v = Value::from("Ada");
    assert_eq!(v.as_str(), Some("Ada"));
    assert_eq!(v.as_f64(), None);
    assert!(!v.is_null());
    assert_eq!(v.type_name(), "text");

    let mut map = BTreeMap::new();
    map.insert("k".to_string(), Value::Bool(false));
    let v = Value::Map(map);
    assert_eq!(v.as_map().map(BTreeMap::len), Some(1));
    assert_eq!(v.type_name(), "map");
}

#[test]
fn event_constructors() {
    let soul = Soul::from("S1");
    let ev = EntityEvent::changed(soul.clone(), "name", Value::Null, "Ada".into());
    match &ev.kind {
        EventKind::Changed(change) => assert_eq!(change.attribute(), "name"),
        other => panic!("unexpected kind {other:?}"),
    }

    let ev = EntityEvent::deleted(soul.clone(), "name", "Ada".into());
    assert_eq!(
        ev.kind,
        EventKind::Changed(AttributeChange::Deleted {
            attribute: "name".into(),
            old: "Ada".into(),
        })
    );

    assert_eq!(EntityEvent::entity_deleted(soul).kind, EventKind::EntityDeleted);
}
