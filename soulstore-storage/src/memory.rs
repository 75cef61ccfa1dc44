use crate::error::{StorageError, StorageResult};
use crate::store::{BackendStore, SetOptions};
use async_trait::async_trait;
use soulstore_types::Soul;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// In-memory record store.
///
/// Counts writes and can be told to fail them, which tests use to observe
/// debouncing and retries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Soul, Vec<u8>>>,
    failing: AtomicBool,
    writes: AtomicUsize,
    immediate_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set` and `del` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful writes flagged `immediate`.
    pub fn immediate_write_count(&self) -> usize {
        self.immediate_writes.load(Ordering::SeqCst)
    }

    /// Returns a copy of the stored record without going through the async
    /// interface.
    pub fn snapshot(&self, soul: &Soul) -> Option<Vec<u8>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(soul)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn has(&self, soul: &Soul) -> StorageResult<bool> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(soul))
    }

    async fn get(&self, soul: &Soul) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.snapshot(soul))
    }

    async fn set(&self, soul: &Soul, bytes: Vec<u8>, options: SetOptions) -> StorageResult<()> {
        self.check_writable()?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(soul.clone(), bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        if options.immediate {
            self.immediate_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn del(&self, soul: &Soul) -> StorageResult<bool> {
        self.check_writable()?;
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(soul)
            .is_some())
    }

    async fn souls(&self) -> StorageResult<Vec<Soul>> {
        let mut souls: Vec<Soul> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        souls.sort();
        Ok(souls)
    }
}
