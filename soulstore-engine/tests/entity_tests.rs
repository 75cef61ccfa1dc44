mod common;

use common::{drain, memory_session, settle};
use pretty_assertions::assert_eq;
use serde_json::json;
use soulstore_engine::{EngineError, EntityAccess, Lifecycle};
use soulstore_model::{AttributeOptions, AttributeView, Schema, codec};
use soulstore_storage::MemoryStore;
use soulstore_types::{AttributeChange, EventKind, Soul, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn map(pairs: &[(&str, Value)]) -> Value {
    Value::Map(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

// ── Reads and writes ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn set_then_get_returns_value_without_flush() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert!(ada.set("name", "Ada".into()).await);
    assert!(ada.set("age", 36.0.into()).await);
    assert_eq!(ada.get("name").await, Some("Ada".into()));
    assert_eq!(ada.get("age").await, Some(36.0.into()));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_and_mistyped_writes_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert!(!ada.set("unknown", "x".into()).await);
    assert!(!ada.set("age", "old".into()).await);
    assert!(!ada.set("_private", "x".into()).await);
    assert_eq!(ada.get("unknown").await, None);
    assert_eq!(ada.get("age").await, None);
}

#[tokio::test(start_paused = true)]
async fn null_deletes_attribute() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    ada.set("name", "Ada".into()).await;
    assert!(ada.set("name", Value::Null).await);
    assert_eq!(ada.get("name").await, None);
    assert!(!ada.delete("name").await);

    let doc = ada.document();
    assert_eq!(doc.get("name"), Some(&serde_json::Value::Null));
}

#[tokio::test(start_paused = true)]
async fn emergent_attributes_come_from_metadata() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert_eq!(
        ada.get("soul").await,
        Some(Value::Text(ada.soul().to_string()))
    );
    assert_eq!(ada.get("origin").await, Some("Person".into()));
    assert!(matches!(ada.get("created").await, Some(Value::Date(_))));
    assert_eq!(ada.get("deleted").await, None);
    assert!(!ada.set("soul", "other".into()).await);
}

#[tokio::test(start_paused = true)]
async fn keys_lists_enumerable_attributes_with_values() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    ada.set("name", "Ada".into()).await;
    ada.set("age", 36.0.into()).await;
    assert_eq!(ada.keys().await, vec!["age".to_string(), "name".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn non_persistent_attribute_stays_local() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    ada.set("name", "Ada".into()).await;
    assert!(ada.set("nickname", "Countess".into()).await);
    ada.materialize().await.unwrap();

    assert_eq!(ada.get("nickname").await, Some("Countess".into()));
    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert!(record.entry.e.contains_key("name"));
    assert!(!record.entry.e.contains_key("nickname"));
}

// ── Materialize ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn materialize_stores_envelope_with_serialized_attribute() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert!(ada.set("name", "Ada".into()).await);
    ada.materialize().await.unwrap();

    let bytes = store.snapshot(ada.soul()).unwrap();
    assert!(bytes.starts_with(b"SSR1:"));
    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.entry.m.o, "Person");
    assert_eq!(
        record.entry.e.get("name"),
        Some(&codec::serialize(&Value::from("Ada")).unwrap())
    );
    assert!(!record.entry.is_tombstone());
    assert_eq!(ada.get("name").await, Some("Ada".into()));
    assert_eq!(ada.lifecycle(), Lifecycle::Materialized);
}

#[tokio::test(start_paused = true)]
async fn materialize_twice_writes_identical_bytes_once() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;

    ada.materialize().await.unwrap();
    let first = store.snapshot(ada.soul()).unwrap();
    ada.materialize().await.unwrap();
    let second = store.snapshot(ada.soul()).unwrap();

    assert_eq!(first, second);
    settle().await;
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn materialize_writes_referenced_children() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert!(ada.set("address", map(&[("street", "Main".into())])).await);
    ada.materialize().await.unwrap();

    let address = ada.get_entity("address").await.unwrap();
    assert_eq!(address.origin(), "Address");
    assert_eq!(address.get("street").await, Some("Main".into()));
    assert!(store.snapshot(address.soul()).is_some());
    assert_eq!(store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn debounced_writes_flush_once() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    ada.set("name", "Ada".into()).await;
    ada.set("age", 36.0.into()).await;
    ada.set("name", "Ada Lovelace".into()).await;
    assert_eq!(session.pending_count(), 1);
    settle().await;

    assert_eq!(store.write_count(), 1);
    assert_eq!(session.pending_count(), 0);
    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert_eq!(record.entry.e.get("name"), Some(&json!("Ada Lovelace")));
}

#[tokio::test(start_paused = true)]
async fn concurrent_sets_apply_in_order_and_flush_latest() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let mut events = session.subscribe();
    let ada = session.create("Person").unwrap();

    let (first, second) = tokio::join!(
        ada.set("name", "v1".into()),
        ada.set("name", "v2".into())
    );
    assert!(first && second);
    assert_eq!(ada.get("name").await, Some("v2".into()));

    let kinds: Vec<EventKind> = drain(&mut events)
        .into_iter()
        .filter(|e| &e.soul == ada.soul())
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Changed(AttributeChange::Set {
                attribute: "name".into(),
                old: Value::Null,
                new: "v1".into(),
            }),
            EventKind::Changed(AttributeChange::Set {
                attribute: "name".into(),
                old: "v1".into(),
                new: "v2".into(),
            }),
        ]
    );

    settle().await;
    assert_eq!(store.write_count(), 1);
    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert_eq!(record.entry.e.get("name"), Some(&json!("v2")));
}

// ── Identity ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn restore_returns_single_representative() {
    let store = Arc::new(MemoryStore::new());
    let writer = memory_session(&store);
    let ada = writer.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;
    ada.materialize().await.unwrap();
    assert!(writer.restore(ada.soul()).await.unwrap().ptr_eq(&ada));

    let reader = memory_session(&store);
    let (a, b) = tokio::join!(reader.restore(ada.soul()), reader.restore(ada.soul()));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.ptr_eq(&b));
    assert!(reader.entity(ada.soul()).unwrap().ptr_eq(&a));
    assert!(!a.ptr_eq(&ada));
    assert_eq!(a.get("name").await, Some("Ada".into()));
}

#[tokio::test(start_paused = true)]
async fn restore_of_unknown_soul_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let missing = Soul::from("missing");

    assert!(matches!(
        session.restore(&missing).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(session.restore_or_none(&missing).await.unwrap().is_none());
    assert_eq!(session.registered_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn references_resolve_lazily_from_backend() {
    let store = Arc::new(MemoryStore::new());
    let writer = memory_session(&store);
    let ada = writer.create("Person").unwrap();
    ada.set("address", map(&[("city", "London".into())])).await;
    ada.materialize().await.unwrap();

    let reader = memory_session(&store);
    let restored = reader.restore(ada.soul()).await.unwrap();
    assert_eq!(reader.registered_count(), 1);
    let address = restored.get_entity("address").await.unwrap();
    assert_eq!(address.get("city").await, Some("London".into()));
    assert_eq!(reader.registered_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn create_with_soul_rejects_used_soul() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let soul = Soul::from("fixed");

    let first = session.create_with_soul("Person", soul.clone()).await.unwrap();
    assert_eq!(first.soul(), &soul);
    assert!(matches!(
        session.create_with_soul("Person", soul).await,
        Err(EngineError::Reservation(_))
    ));
    assert!(matches!(
        session.create("Nope"),
        Err(EngineError::Schema(_))
    ));
}

// ── Transient entities ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transient_entity_is_stored_once_referenced() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let friend = session.transient("Person").unwrap();
    friend.set("name", "Charles".into()).await;
    settle().await;

    assert_eq!(friend.lifecycle(), Lifecycle::Transient);
    assert!(session.entity(friend.soul()).is_none());
    assert!(store.is_empty());

    let ada = session.create("Person").unwrap();
    assert!(ada.set("friend", friend.to_value()).await);
    assert_eq!(friend.lifecycle(), Lifecycle::Reserved);
    assert!(matches!(friend.reserve(), Err(EngineError::Reservation(_))));

    ada.materialize().await.unwrap();
    assert_eq!(friend.lifecycle(), Lifecycle::Materialized);
    assert!(store.snapshot(friend.soul()).is_some());
    let resolved = ada.get_entity("friend").await.unwrap();
    assert!(resolved.ptr_eq(&friend));
}

// ── Deletion ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn deleting_child_clears_parent_reference() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let mut events = session.subscribe();
    let parent = session.create("Person").unwrap();
    let child = session.create("Person").unwrap();
    child.set("name", "Child".into()).await;
    parent.set("friend", child.to_value()).await;
    assert_eq!(
        parent.get("friend").await,
        Some(Value::Entity(child.soul().clone()))
    );

    child.delete_entity().await.unwrap();

    assert!(child.is_deleted());
    assert_eq!(parent.get("friend").await, None);
    assert_eq!(child.get("name").await, None);
    assert!(session.entity(child.soul()).is_none());
    assert!(session.restore_or_none(child.soul()).await.unwrap().is_none());
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| &e.soul == child.soul() && e.kind == EventKind::EntityDeleted)
    );
}

#[tokio::test(start_paused = true)]
async fn deleted_entity_stays_browsable_as_tombstone() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;
    ada.materialize().await.unwrap();

    ada.delete_entity().await.unwrap();
    settle().await;

    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert!(record.entry.is_tombstone());

    let view = session.open_tombstone(ada.soul()).await.unwrap();
    assert!(view.is_read_only());
    assert!(view.is_deleted());
    assert_eq!(view.get("name").await, Some("Ada".into()));
    assert!(matches!(view.get("deleted").await, Some(Value::Date(_))));
    assert!(!view.set("name", "Bob".into()).await);
    assert!(matches!(
        view.delete_entity().await,
        Err(EngineError::ReadOnly(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn purge_drops_backend_record() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;
    ada.materialize().await.unwrap();

    ada.purge().await.unwrap();
    settle().await;

    assert!(store.snapshot(ada.soul()).is_none());
    assert!(session.open_tombstone(ada.soul()).await.is_err());
}

// ── Attribute policies ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn autocomplete_and_derived_attributes() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(
        Schema::builder("Counter")
            .attribute(
                "count",
                AttributeOptions::number().autocomplete(true).default_value(0.0),
            )
            .attribute("settings", AttributeOptions::untyped_object().autocomplete(true))
            .attribute("label", AttributeOptions::text().default_value("none"))
            .derive("double", |view: &AttributeView| {
                Value::Number(view.get_number("count").unwrap_or(0.0) * 2.0)
            })
            .build(),
    );
    let counter = session.create("Counter").unwrap();

    assert_eq!(counter.get("count").await, Some(0.0.into()));
    assert_eq!(counter.keys().await, vec!["count".to_string()]);
    assert_eq!(counter.get("label").await, Some("none".into()));
    assert!(counter.set("count", 21.0.into()).await);
    assert_eq!(counter.get("double").await, Some(42.0.into()));
    assert!(!counter.set("double", 1.0.into()).await);

    let settings = counter.get_entity("settings").await.unwrap();
    assert_eq!(settings.origin(), "Object");
    assert!(settings.set("theme", "dark".into()).await);
    assert_eq!(settings.get("theme").await, Some("dark".into()));
}

#[tokio::test(start_paused = true)]
async fn merge_attributes_combine_instead_of_replacing() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(
        Schema::builder("Profile")
            .attribute("prefs", AttributeOptions::compound())
            .attribute("home", AttributeOptions::object("Address").merge(true))
            .build(),
    );
    let profile = session.create("Profile").unwrap();

    profile.set("prefs", map(&[("a", 1.0.into())])).await;
    profile.set("prefs", map(&[("b", 2.0.into())])).await;
    assert_eq!(
        profile.get("prefs").await,
        Some(map(&[("a", 1.0.into()), ("b", 2.0.into())]))
    );

    profile.set("home", map(&[("street", "Main".into())])).await;
    let home = profile.get_entity("home").await.unwrap();
    assert!(profile.set("home", map(&[("city", "Paris".into())])).await);
    let merged = profile.get_entity("home").await.unwrap();
    assert!(merged.ptr_eq(&home));
    assert_eq!(merged.get("street").await, Some("Main".into()));
    assert_eq!(merged.get("city").await, Some("Paris".into()));
}

#[tokio::test(start_paused = true)]
async fn list_values_become_array_entities() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    assert!(
        ada.set("tags", Value::List(vec!["math".into(), "poetry".into()]))
            .await
    );
    let tags = ada.get_entity("tags").await.unwrap();

    assert_eq!(tags.origin(), "Array");
    assert_eq!(
        tags.list_values().await,
        vec![Value::from("math"), Value::from("poetry")]
    );
    assert_eq!(tags.keys().await, vec!["0".to_string(), "1".to_string()]);
    assert_eq!(tags.document().get_meta("len"), Some(&json!(2)));
}

#[tokio::test(start_paused = true)]
async fn ephemeral_entities_are_never_stored() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(
        Schema::builder("Scratch")
            .attribute("note", AttributeOptions::text())
            .ephemeral(true)
            .build(),
    );
    let scratch = session.create("Scratch").unwrap();

    scratch.set("note", "draft".into()).await;
    scratch.materialize().await.unwrap();
    settle().await;

    assert!(store.is_empty());
    assert_eq!(scratch.get("note").await, Some("draft".into()));
}

#[tokio::test(start_paused = true)]
async fn immediate_entities_bypass_debounce() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(
        Schema::builder("Alarm")
            .attribute("level", AttributeOptions::number())
            .immediate(true)
            .build(),
    );
    let alarm = session.create("Alarm").unwrap();

    alarm.set("level", 3.0.into()).await;
    settle().await;

    assert_eq!(store.immediate_write_count(), 1);
    assert_eq!(session.pending_count(), 0);
}
