//! Ports the engines depend on.
//!
//! Each engine receives only the capabilities it uses, as trait objects, so
//! backends can be swapped (or faked in tests) without touching engine code.
//! [`KeyphraseStorage`](crate::storage::KeyphraseStorage) implements both
//! ports over [`common::Storage`].

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{BaseUrlOccurrenceUpdate, Connection, TotalDelta};

/// Occurrence/total store as seen by the engines.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// Adds each delta to its total row. The whole slice is applied
    /// atomically: on error no total has changed.
    async fn apply_total_deltas(&self, deltas: &[TotalDelta]) -> Result<()>;

    /// Current occurrence and total rows stored under `listening_key`, as
    /// the updates a fresh subscriber needs to catch up.
    async fn read_site(&self, listening_key: &str) -> Result<Vec<BaseUrlOccurrenceUpdate>>;
}

/// Registry of live connections.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Connections currently listening on `listening_key`.
    async fn connections_for(&self, listening_key: &str) -> Result<Vec<Connection>>;

    /// Records a new subscriber, replacing any row with the same ID.
    async fn register(&self, connection: &Connection) -> Result<()>;

    /// Removes a subscriber. Returns whether it was registered.
    async fn deregister(&self, connection_id: &str) -> Result<bool>;
}
