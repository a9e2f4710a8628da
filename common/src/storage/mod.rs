//! Storage port shared by the system crates.
//!
//! Systems talk to storage through the [`StorageRead`] and [`Storage`]
//! traits so the backend can be swapped without touching domain code. Writes
//! are submitted as batches of [`RecordOp`]s that are applied atomically,
//! and every applied batch is published to subscribers as a stream of
//! [`StorageChange`]s, which is the change feed the system crates consume.

pub mod config;
pub mod factory;
pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::BytesRange;

/// A key/value pair as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// A single write operation within an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOp {
    /// Overwrite the value stored at the key.
    Put(Record),
    /// Combine the operand with the stored value using the configured
    /// [`MergeOperator`].
    Merge(Record),
    /// Remove the key.
    Delete(Bytes),
}

impl RecordOp {
    pub fn key(&self) -> &Bytes {
        match self {
            RecordOp::Put(record) | RecordOp::Merge(record) => &record.key,
            RecordOp::Delete(key) => key,
        }
    }
}

/// Error type for storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend failed to serve the request (I/O, unavailable, ...).
    Storage(String),
    /// An invariant of the storage layer itself was violated.
    Internal(String),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Defines how a [`RecordOp::Merge`] operand combines with the stored value.
///
/// Merges are resolved inside the same critical section as the rest of the
/// batch, which makes them the storage-native atomic read-modify-write.
pub trait MergeOperator: Send + Sync {
    fn merge(&self, key: &Bytes, existing_value: Option<Bytes>, new_value: Bytes) -> Bytes;
}

/// Kind of mutation a [`StorageChange`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One row-level mutation published on the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Store-wide, monotonically increasing sequence number.
    pub sequence: u64,
    pub key: Bytes,
    /// Value before the batch was applied, if the key existed.
    pub previous: Option<Bytes>,
    /// Value after the batch was applied, if the key still exists.
    pub current: Option<Bytes>,
}

impl StorageChange {
    pub fn kind(&self) -> ChangeKind {
        match (&self.previous, &self.current) {
            (None, _) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Modify,
            (Some(_), None) => ChangeKind::Remove,
        }
    }
}

/// Read access to storage.
#[async_trait]
pub trait StorageRead: Send + Sync {
    /// Returns the record stored at `key`, if any.
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>>;

    /// Returns all records within `range`, in key order.
    async fn scan(&self, range: BytesRange) -> StorageResult<Vec<Record>>;
}

/// Read-write access to storage.
#[async_trait]
pub trait Storage: StorageRead {
    /// Applies a batch of operations atomically.
    async fn apply(&self, ops: Vec<RecordOp>) -> StorageResult<()>;

    /// Returns a point-in-time read view.
    async fn snapshot(&self) -> StorageResult<Arc<dyn StorageRead>>;

    /// Persists any buffered writes.
    async fn flush(&self) -> StorageResult<()>;

    /// Subscribes to the change feed. Only changes applied after the call
    /// are delivered, in sequence order, and none are skipped.
    fn subscribe(&self) -> StorageResult<mpsc::UnboundedReceiver<StorageChange>>;
}
