mod common;

use common::{drain, memory_session, settle};
use pretty_assertions::assert_eq;
use soulstore_engine::{EngineError, EntityAccess, TransactionState};
use soulstore_model::{AttributeOptions, AttributeView, EntityHooks, Schema};
use soulstore_storage::MemoryStore;
use soulstore_types::{EventKind, Value};
use std::sync::Arc;

struct PositiveBalance;

impl EntityHooks for PositiveBalance {
    fn validate(&self, view: &AttributeView) -> Result<(), String> {
        match view.get_number("balance") {
            Some(balance) if balance < 0.0 => Err(format!("balance {balance} is negative")),
            _ => Ok(()),
        }
    }
}

fn account_schema() -> Schema {
    Schema::builder("Account")
        .attribute("owner", AttributeOptions::text().mandatory(true))
        .attribute("balance", AttributeOptions::number())
        .hooks(Arc::new(PositiveBalance))
        .build()
}

// ── Commit ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn writes_are_deferred_until_commit() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    let tx = session.begin().unwrap();
    assert_eq!(tx.state(), TransactionState::Active);
    ada.set("name", "Ada".into()).await;
    ada.set("age", 36.0.into()).await;
    ada.materialize().await.unwrap();
    settle().await;

    assert_eq!(store.write_count(), 0);
    assert_eq!(session.pending_count(), 0);
    assert!(tx.involves(ada.soul()));
    assert_eq!(ada.get("name").await, Some("Ada".into()));

    tx.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(session.current_transaction().is_none());
    assert_eq!(store.write_count(), 1);
    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert!(record.entry.e.contains_key("name"));
    assert!(record.entry.e.contains_key("age"));
}

#[tokio::test(start_paused = true)]
async fn commit_writes_tombstone_of_entity_deleted_inside() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;
    ada.materialize().await.unwrap();

    let tx = session.begin().unwrap();
    ada.delete_entity().await.unwrap();
    tx.commit().await.unwrap();

    let record = session.stored_record(ada.soul()).await.unwrap().unwrap();
    assert!(record.entry.is_tombstone());
}

#[tokio::test(start_paused = true)]
async fn committed_transaction_cannot_commit_again() {
    let session = memory_session(&Arc::new(MemoryStore::new()));
    let tx = session.begin().unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(tx.commit().await, Err(EngineError::Transaction(_))));
    assert!(matches!(tx.rollback(), Err(EngineError::Transaction(_))));
}

#[tokio::test(start_paused = true)]
async fn failed_commit_write_marks_transaction_failed() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    let tx = session.begin().unwrap();
    ada.set("name", "Ada".into()).await;
    store.set_failing(true);

    assert!(matches!(tx.commit().await, Err(EngineError::BackendIo(_))));
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(session.pending_count(), 1);

    store.set_failing(false);
    settle().await;
    assert_eq!(store.write_count(), 1);
}

// ── Prepare ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn missing_mandatory_attribute_fails_prepare() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(account_schema());
    let account = session.create("Account").unwrap();

    let tx = session.begin().unwrap();
    account.set("balance", 10.0.into()).await;

    assert!(matches!(tx.commit().await, Err(EngineError::Transaction(_))));
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(store.write_count(), 0);

    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionState::Aborted);
    assert!(session.current_transaction().is_none());
    assert_eq!(account.get("balance").await, None);
}

#[tokio::test(start_paused = true)]
async fn hook_validation_fails_prepare() {
    let session = memory_session(&Arc::new(MemoryStore::new()));
    session.register_schema(account_schema());
    let account = session.create("Account").unwrap();

    let tx = session.begin().unwrap();
    account.set("owner", "Ada".into()).await;
    account.set("balance", (-5.0).into()).await;

    assert!(tx.prepare().is_err());
    assert_eq!(tx.state(), TransactionState::Failed);
    assert!(matches!(tx.commit().await, Err(EngineError::Transaction(_))));
}

#[tokio::test(start_paused = true)]
async fn valid_entity_prepares_then_commits() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    session.register_schema(account_schema());
    let account = session.create("Account").unwrap();

    let tx = session.begin().unwrap();
    account.set("owner", "Ada".into()).await;
    account.set("balance", 5.0.into()).await;
    tx.prepare().unwrap();
    assert_eq!(tx.state(), TransactionState::PartiallyCommitted);

    tx.commit().await.unwrap();
    assert_eq!(store.write_count(), 1);
}

// ── Rollback ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rollback_restores_previous_values() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;
    ada.materialize().await.unwrap();
    let mut events = session.subscribe();

    let tx = session.begin().unwrap();
    ada.set("name", "Bob".into()).await;
    ada.set("age", 3.0.into()).await;
    drain(&mut events);
    tx.rollback().unwrap();
    settle().await;

    assert_eq!(tx.state(), TransactionState::Aborted);
    assert_eq!(ada.get("name").await, Some("Ada".into()));
    assert_eq!(ada.get("age").await, None);
    assert_eq!(store.write_count(), 1);
    let reverted: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Changed(change) => Some(change.attribute().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(reverted, vec!["name".to_string(), "age".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rollback_revives_deleted_entity_and_its_referrers() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let parent = session.create("Person").unwrap();
    let child = session.create("Person").unwrap();
    child.set("name", "Child".into()).await;
    parent.set("friend", child.to_value()).await;
    session.flush().await.unwrap();

    let tx = session.begin().unwrap();
    child.delete_entity().await.unwrap();
    assert!(child.is_deleted());
    assert!(session.entity(child.soul()).is_none());
    assert_eq!(parent.get("friend").await, None);

    tx.rollback().unwrap();

    assert!(!child.is_deleted());
    assert!(session.entity(child.soul()).unwrap().ptr_eq(&child));
    assert_eq!(child.get("name").await, Some("Child".into()));
    assert_eq!(
        parent.get("friend").await,
        Some(Value::Entity(child.soul().clone()))
    );
}

#[tokio::test(start_paused = true)]
async fn rollback_keeps_unflushed_write_from_before_begin() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();
    ada.set("name", "Ada".into()).await;

    let tx = session.begin().unwrap();
    ada.set("name", "Grace".into()).await;
    settle().await;
    assert_eq!(store.write_count(), 0);
    assert_eq!(session.pending_count(), 1);

    tx.rollback().unwrap();
    settle().await;

    assert_eq!(store.write_count(), 1);
    assert_eq!(session.pending_count(), 0);
    let reader = memory_session(&store);
    let stored = reader.restore(ada.soul()).await.unwrap();
    assert_eq!(stored.get("name").await, Some("Ada".into()));
}

// ── Nesting ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn child_commit_hands_entities_to_parent() {
    let store = Arc::new(MemoryStore::new());
    let session = memory_session(&store);
    let ada = session.create("Person").unwrap();

    let outer = session.begin().unwrap();
    let inner = session.begin().unwrap();
    assert_eq!(inner.parent().map(|p| p.id()), Some(outer.id()));
    ada.set("name", "Ada".into()).await;
    assert!(inner.involves(ada.soul()));

    inner.commit().await.unwrap();
    assert_eq!(inner.state(), TransactionState::Committed);
    assert_eq!(store.write_count(), 0);
    assert!(outer.involves(ada.soul()));
    assert_eq!(session.current_transaction().map(|t| t.id()), Some(outer.id()));

    outer.commit().await.unwrap();
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn child_rollback_keeps_parent_changes() {
    let session = memory_session(&Arc::new(MemoryStore::new()));
    let ada = session.create("Person").unwrap();

    let outer = session.begin().unwrap();
    ada.set("name", "Ada".into()).await;
    let inner = session.begin().unwrap();
    ada.set("age", 36.0.into()).await;
    inner.rollback().unwrap();

    assert_eq!(ada.get("age").await, None);
    assert_eq!(ada.get("name").await, Some("Ada".into()));
    assert!(outer.involves(ada.soul()));
    assert_eq!(session.current_transaction().map(|t| t.id()), Some(outer.id()));
    outer.rollback().unwrap();
    assert_eq!(ada.get("name").await, None);
}
