use crate::AttributeView;

/// Optional per-schema callbacks.
///
/// Most schemas do NOT need this: attribute policy alone drives the engine.
/// Implement it for cross-attribute validation at transaction prepare time
/// or for post-restore bookkeeping.
pub trait EntityHooks: Send + Sync {
    /// Validate an entity before a transaction involving it commits.
    /// Return `Err(message)` to fail the transaction.
    fn validate(&self, view: &AttributeView) -> Result<(), String> {
        let _ = view;
        Ok(())
    }

    /// Called after an entity was restored from the backend store.
    fn on_after_restore(&self, view: &AttributeView) {
        let _ = view;
    }
}
