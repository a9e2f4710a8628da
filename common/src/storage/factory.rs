//! Storage factory for creating storage instances from configuration.

use std::sync::Arc;

use super::config::StorageConfig;
use super::in_memory::InMemoryStorage;
use super::{MergeOperator, Storage, StorageResult};

/// Storage semantics configured by system crates.
///
/// Holds concerns like merge operators that are specific to each system.
/// End users should not need this directly; each system configures its own
/// semantics internally.
///
/// # Example (for system crate implementers)
///
/// ```rust,ignore
/// let semantics = StorageSemantics::new()
///     .with_merge_operator(Arc::new(TotalMergeOperator));
/// let storage = create_storage(&config, semantics).await?;
/// ```
#[derive(Default)]
pub struct StorageSemantics {
    pub(crate) merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl StorageSemantics {
    /// Creates new storage semantics with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the merge operator for merge operations.
    pub fn with_merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(op);
        self
    }
}

/// Creates a storage instance based on configuration and semantics.
///
/// # Arguments
///
/// * `config` - The storage configuration specifying the backend type.
/// * `semantics` - System-specific semantics like merge operators.
pub async fn create_storage(
    config: &StorageConfig,
    semantics: StorageSemantics,
) -> StorageResult<Arc<dyn Storage>> {
    match config {
        StorageConfig::InMemory => {
            let storage = match semantics.merge_operator {
                Some(op) => InMemoryStorage::with_merge_operator(op),
                None => InMemoryStorage::new(),
            };
            tracing::debug!("created in-memory storage");
            Ok(Arc::new(storage))
        }
    }
}
