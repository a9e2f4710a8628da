//! Serializable storage configuration.

/// Selects the storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// Process-local storage. Contents are lost on shutdown.
    #[default]
    InMemory,
}
