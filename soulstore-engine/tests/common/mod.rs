#![allow(dead_code)]

use soulstore_engine::{EngineConfig, GraphSession};
use soulstore_model::{AttributeOptions, Schema, SchemaRegistry};
use soulstore_storage::MemoryStore;
use soulstore_sync::LocalSyncManager;
use soulstore_types::{EntityEvent, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `Person` and `Address`, the schemas most tests work with.
pub fn schemas() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry.register(
        Schema::builder("Person")
            .attribute("name", AttributeOptions::text())
            .attribute("age", AttributeOptions::number())
            .attribute("address", AttributeOptions::object("Address"))
            .attribute("friend", AttributeOptions::object("Person"))
            .attribute("tags", AttributeOptions::collection())
            .attribute("nickname", AttributeOptions::text().persistent(false))
            .build(),
    );
    registry.register(
        Schema::builder("Address")
            .attribute("street", AttributeOptions::text())
            .attribute("city", AttributeOptions::text())
            .build(),
    );
    Arc::new(registry)
}

/// Waits long enough for every debounced flush and spawned merge to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

pub fn memory_session(store: &Arc<MemoryStore>) -> GraphSession {
    memory_session_with(store, EngineConfig::default())
}

pub fn memory_session_with(store: &Arc<MemoryStore>, config: EngineConfig) -> GraphSession {
    init_tracing();
    GraphSession::builder()
        .config(config)
        .store(Arc::clone(store) as _)
        .schemas(schemas())
        .build()
        .unwrap()
}

/// A replica with its own store, connected through `sync`.
pub fn replica(sync: LocalSyncManager) -> (GraphSession, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let session = GraphSession::builder()
        .store(Arc::clone(&store) as _)
        .sync(Arc::new(sync))
        .schemas(schemas())
        .build()
        .unwrap();
    (session, store)
}

pub fn new_peer() -> PeerId {
    PeerId::new()
}

/// Everything received so far.
pub fn drain(events: &mut broadcast::Receiver<EntityEvent>) -> Vec<EntityEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
