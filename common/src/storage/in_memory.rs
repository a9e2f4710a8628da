//! Process-local storage backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    MergeOperator, Record, RecordOp, Storage, StorageChange, StorageError, StorageRead,
    StorageResult,
};
use crate::BytesRange;

struct State {
    data: Arc<BTreeMap<Bytes, Bytes>>,
    next_sequence: u64,
}

/// In-memory storage over an ordered map.
///
/// Batches are applied under a single write lock, so readers never observe
/// a partially applied batch. Snapshots share the map copy-on-write: a write
/// only copies the map while a snapshot still holds the previous version.
///
/// Every subscriber gets its own unbounded queue of changes, so a slow
/// subscriber never causes another one (or itself) to miss a change.
pub struct InMemoryStorage {
    state: RwLock<State>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StorageChange>>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_merge_operator(op: Arc<dyn MergeOperator>) -> Self {
        Self::build(Some(op))
    }

    fn build(merge_operator: Option<Arc<dyn MergeOperator>>) -> Self {
        Self {
            state: RwLock::new(State {
                data: Arc::new(BTreeMap::new()),
                next_sequence: 1,
            }),
            merge_operator,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn read_data(&self) -> StorageResult<Arc<BTreeMap<Bytes, Bytes>>> {
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Internal("storage lock poisoned".to_string()))?;
        Ok(state.data.clone())
    }

    /// Hands `changes` to every live subscriber, forgetting closed ones.
    fn publish(&self, changes: &[StorageChange]) -> StorageResult<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| StorageError::Internal("subscriber lock poisoned".to_string()))?;
        subscribers.retain(|tx| changes.iter().all(|change| tx.send(change.clone()).is_ok()));
        Ok(())
    }
}

/// Applies `ops` to `data`, returning one (key, value before the batch)
/// entry per touched key in first-touch order.
///
/// Callers must check that a merge operator exists when `ops` contains a
/// merge; with that checked this cannot fail, so `data` never holds a
/// partially applied batch.
fn apply_ops(
    data: &mut BTreeMap<Bytes, Bytes>,
    ops: Vec<RecordOp>,
    merge_operator: Option<&Arc<dyn MergeOperator>>,
) -> Vec<(Bytes, Option<Bytes>)> {
    let mut touched: Vec<(Bytes, Option<Bytes>)> = Vec::new();
    let mut seen: HashSet<Bytes> = HashSet::with_capacity(ops.len());
    for op in ops {
        let key = op.key().clone();
        if seen.insert(key.clone()) {
            let previous = data.get(&key).cloned();
            touched.push((key, previous));
        }
        match op {
            RecordOp::Put(record) => {
                data.insert(record.key, record.value);
            }
            RecordOp::Merge(record) => {
                if let Some(op) = merge_operator {
                    let existing = data.get(&record.key).cloned();
                    let merged = op.merge(&record.key, existing, record.value);
                    data.insert(record.key, merged);
                }
            }
            RecordOp::Delete(key) => {
                data.remove(&key);
            }
        }
    }
    touched
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let data = self.read_data()?;
        Ok(data.get(&key).map(|value| Record::new(key, value.clone())))
    }

    async fn scan(&self, range: BytesRange) -> StorageResult<Vec<Record>> {
        let data = self.read_data()?;
        Ok(scan_map(&data, &range))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn apply(&self, ops: Vec<RecordOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.merge_operator.is_none() && ops.iter().any(|op| matches!(op, RecordOp::Merge(_))) {
            return Err(StorageError::Internal(
                "merge operator not configured".to_string(),
            ));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::Internal("storage lock poisoned".to_string()))?;
        let mut next_sequence = state.next_sequence;
        let data = Arc::make_mut(&mut state.data);
        let touched = apply_ops(data, ops, self.merge_operator.as_ref());

        let mut changes = Vec::with_capacity(touched.len());
        for (key, previous) in touched {
            let current = data.get(&key).cloned();
            if previous.is_none() && current.is_none() {
                continue;
            }
            changes.push(StorageChange {
                sequence: next_sequence,
                key,
                previous,
                current,
            });
            next_sequence += 1;
        }
        state.next_sequence = next_sequence;

        // published under the write lock so subscribers see sequence order
        self.publish(&changes)
    }

    async fn snapshot(&self) -> StorageResult<Arc<dyn StorageRead>> {
        Ok(Arc::new(InMemorySnapshot {
            data: self.read_data()?,
        }))
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn subscribe(&self) -> StorageResult<mpsc::UnboundedReceiver<StorageChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| StorageError::Internal("subscriber lock poisoned".to_string()))?
            .push(tx);
        Ok(rx)
    }
}

/// Point-in-time view of an [`InMemoryStorage`].
struct InMemorySnapshot {
    data: Arc<BTreeMap<Bytes, Bytes>>,
}

#[async_trait]
impl StorageRead for InMemorySnapshot {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        Ok(self
            .data
            .get(&key)
            .map(|value| Record::new(key, value.clone())))
    }

    async fn scan(&self, range: BytesRange) -> StorageResult<Vec<Record>> {
        Ok(scan_map(&self.data, &range))
    }
}

fn scan_map(data: &BTreeMap<Bytes, Bytes>, range: &BytesRange) -> Vec<Record> {
    if range.is_empty() {
        return Vec::new();
    }
    data.range::<Bytes, _>(range.clone())
        .map(|(k, v)| Record::new(k.clone(), v.clone()))
        .collect()
}
