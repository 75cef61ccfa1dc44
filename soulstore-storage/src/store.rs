use crate::error::StorageResult;
use async_trait::async_trait;
use soulstore_types::Soul;

/// Options for [`BackendStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// The record belongs to a priority entity and was written without
    /// debouncing. Stores may use it to skip their own write buffering.
    pub immediate: bool,
}

impl SetOptions {
    pub fn immediate() -> Self {
        Self { immediate: true }
    }
}

/// Key-addressable storage of binary records.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Short name of the store, for logs.
    fn name(&self) -> &'static str;

    /// Returns whether a record exists for `soul`.
    async fn has(&self, soul: &Soul) -> StorageResult<bool>;

    /// Reads the record for `soul`.
    async fn get(&self, soul: &Soul) -> StorageResult<Option<Vec<u8>>>;

    /// Writes (or replaces) the record for `soul`.
    async fn set(&self, soul: &Soul, bytes: Vec<u8>, options: SetOptions) -> StorageResult<()>;

    /// Removes the record for `soul`. Returns whether one existed.
    async fn del(&self, soul: &Soul) -> StorageResult<bool>;

    /// Lists the souls with a stored record.
    async fn souls(&self) -> StorageResult<Vec<Soul>>;
}
