//! Keyphrase-specific storage on top of [`common::Storage`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    Record, RecordOp, Storage, StorageConfig, StorageRead, StorageSemantics, create_storage,
};

use crate::error::{Error, Result};
use crate::model::{
    BaseUrlOccurrenceUpdate, Connection, MAX_OCCURRENCES, OccurrenceRecord, SORT_KEY_SEPARATOR,
    TOTAL_MARKER, TotalDelta, TotalScope,
};
use crate::serde::{
    ConnectionKey, ConnectionValue, ListeningIndexKey, OccurrenceKey, OccurrenceValue, TotalKey,
    TotalValue,
};
use crate::traits::{ConnectionRegistry, OccurrenceStore};

mod merge_operator;

pub(crate) use merge_operator::TotalMergeOperator;

/// Read helpers available on any [`StorageRead`], including snapshots.
#[async_trait]
pub(crate) trait KeyphraseStorageReadExt: StorageRead {
    /// Occurrence rows of one site, in pathname order.
    async fn load_occurrences(&self, site_key: &str) -> Result<Vec<BaseUrlOccurrenceUpdate>> {
        let records = self.scan(OccurrenceKey::site_range(site_key)).await?;
        let mut updates = Vec::with_capacity(records.len());
        for record in records {
            let key = OccurrenceKey::decode(&record.key)?;
            let value = OccurrenceValue::decode(&record.value)?;
            updates.push(BaseUrlOccurrenceUpdate {
                listening_key: key.site_key,
                pathname: key.pathname,
                keyphrase: key.keyphrase,
                occurrences: value.occurrences,
            });
        }
        Ok(updates)
    }

    /// Total rows stored under one partition key, with empty pathnames.
    async fn load_totals(&self, partition_key: &str) -> Result<Vec<BaseUrlOccurrenceUpdate>> {
        let records = self.scan(TotalKey::partition_range(partition_key)).await?;
        let mut updates = Vec::with_capacity(records.len());
        for record in records {
            let key = TotalKey::decode(&record.key)?;
            let value = TotalValue::decode(&record.value)?;
            updates.push(BaseUrlOccurrenceUpdate {
                listening_key: partition_key.to_string(),
                pathname: String::new(),
                keyphrase: key.keyphrase,
                occurrences: value.occurrences(),
            });
        }
        Ok(updates)
    }

    async fn load_connection(&self, connection_id: &str) -> Result<Option<Connection>> {
        let key = ConnectionKey {
            connection_id: connection_id.to_string(),
        }
        .encode();
        match self.get(key).await? {
            Some(record) => Ok(Some(
                ConnectionValue::decode(&record.value)?.into_connection(connection_id.to_string()),
            )),
            None => Ok(None),
        }
    }
}

impl<T: ?Sized + StorageRead> KeyphraseStorageReadExt for T {}

/// Domain view of the backing store: occurrence rows, total rows and the
/// connection registry.
#[derive(Clone)]
pub struct KeyphraseStorage {
    storage: Arc<dyn Storage>,
}

impl KeyphraseStorage {
    /// Wraps storage that was created with [`KeyphraseStorage::semantics`].
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Creates the backing store with the merge semantics totals rely on.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let storage = create_storage(config, Self::semantics()).await?;
        Ok(Self::new(storage))
    }

    pub fn semantics() -> StorageSemantics {
        StorageSemantics::new().with_merge_operator(Arc::new(TotalMergeOperator))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Writes page-level occurrence rows in one atomic batch. This is the
    /// write made by the extraction collaborator.
    pub async fn put_occurrences(&self, records: &[OccurrenceRecord]) -> Result<()> {
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            validate_occurrence(record)?;
            let key = OccurrenceKey {
                site_key: record.site_key.clone(),
                pathname: record.pathname.clone(),
                keyphrase: record.keyphrase.clone(),
            }
            .encode();
            let value = OccurrenceValue {
                occurrences: record.occurrences,
                aggregated: record.aggregated,
            }
            .encode();
            ops.push(RecordOp::Put(Record::new(key, value)));
        }
        self.storage.apply(ops).await?;
        Ok(())
    }

    /// Removes page-level occurrence rows.
    pub async fn delete_occurrence(
        &self,
        site_key: &str,
        pathname: &str,
        keyphrase: &str,
    ) -> Result<()> {
        let key = OccurrenceKey {
            site_key: site_key.to_string(),
            pathname: pathname.to_string(),
            keyphrase: keyphrase.to_string(),
        }
        .encode();
        self.storage.apply(vec![RecordOp::Delete(key)]).await?;
        Ok(())
    }

    /// Current value of one total row; zero if it does not exist.
    pub async fn read_total(&self, scope: &TotalScope, keyphrase: &str) -> Result<u64> {
        let key = TotalKey {
            scope: scope.clone(),
            keyphrase: keyphrase.to_string(),
        }
        .encode();
        match self.storage.get(key).await? {
            Some(record) => Ok(TotalValue::decode(&record.value)?.occurrences()),
            None => Ok(0),
        }
    }

    /// Lightweight read used by readiness probes.
    pub async fn check_storage(&self) -> Result<()> {
        self.storage.snapshot().await?;
        Ok(())
    }

    pub async fn connection(&self, connection_id: &str) -> Result<Option<Connection>> {
        self.storage.load_connection(connection_id).await
    }
}

fn validate_occurrence(record: &OccurrenceRecord) -> Result<()> {
    if record.site_key.is_empty() || record.site_key == TOTAL_MARKER {
        return Err(Error::InvalidInput(format!(
            "invalid site key: {:?}",
            record.site_key
        )));
    }
    if record.pathname.is_empty() || record.pathname.contains(SORT_KEY_SEPARATOR) {
        return Err(Error::InvalidInput(format!(
            "invalid pathname: {:?}",
            record.pathname
        )));
    }
    if record.pathname == TOTAL_MARKER {
        return Err(Error::InvalidInput("pathname collides with TOTAL marker".into()));
    }
    if record.keyphrase.is_empty() {
        return Err(Error::InvalidInput("empty keyphrase".into()));
    }
    if record.occurrences > MAX_OCCURRENCES {
        return Err(Error::InvalidInput(format!(
            "occurrences out of range: {}",
            record.occurrences
        )));
    }
    Ok(())
}

fn validate_connection(connection: &Connection) -> Result<()> {
    if connection.connection_id.is_empty() {
        return Err(Error::InvalidInput("empty connection id".into()));
    }
    if connection.callback_endpoint.is_empty() {
        return Err(Error::InvalidInput("empty callback endpoint".into()));
    }
    if connection.listening_key.is_empty() {
        return Err(Error::InvalidInput("empty listening key".into()));
    }
    Ok(())
}

#[async_trait]
impl OccurrenceStore for KeyphraseStorage {
    async fn apply_total_deltas(&self, deltas: &[TotalDelta]) -> Result<()> {
        let ops = deltas
            .iter()
            .map(|delta| {
                let key = TotalKey {
                    scope: delta.scope.clone(),
                    keyphrase: delta.keyphrase.clone(),
                }
                .encode();
                RecordOp::Merge(Record::new(key, TotalValue { count: delta.delta }.encode()))
            })
            .collect();
        self.storage.apply(ops).await?;
        Ok(())
    }

    async fn read_site(&self, listening_key: &str) -> Result<Vec<BaseUrlOccurrenceUpdate>> {
        // one snapshot so pages and totals agree with each other
        let snapshot = self.storage.snapshot().await?;
        let mut updates = snapshot.load_occurrences(listening_key).await?;
        updates.extend(snapshot.load_totals(listening_key).await?);
        Ok(updates)
    }
}

#[async_trait]
impl ConnectionRegistry for KeyphraseStorage {
    async fn connections_for(&self, listening_key: &str) -> Result<Vec<Connection>> {
        let snapshot = self.storage.snapshot().await?;
        let index = snapshot
            .scan(ListeningIndexKey::listening_range(listening_key))
            .await?;
        let mut connections = Vec::with_capacity(index.len());
        for record in index {
            let entry = ListeningIndexKey::decode(&record.key)?;
            match snapshot.load_connection(&entry.connection_id).await? {
                Some(connection) if connection.listening_key == listening_key => {
                    connections.push(connection)
                }
                _ => tracing::debug!(
                    connection_id = %entry.connection_id,
                    listening_key,
                    "skipping stale listening index entry"
                ),
            }
        }
        Ok(connections)
    }

    async fn register(&self, connection: &Connection) -> Result<()> {
        validate_connection(connection)?;
        let mut ops = Vec::with_capacity(3);
        if let Some(existing) = self.storage.load_connection(&connection.connection_id).await?
            && existing.listening_key != connection.listening_key
        {
            ops.push(RecordOp::Delete(
                ListeningIndexKey {
                    listening_key: existing.listening_key,
                    connection_id: existing.connection_id,
                }
                .encode(),
            ));
        }
        ops.push(RecordOp::Put(Record::new(
            ConnectionKey {
                connection_id: connection.connection_id.clone(),
            }
            .encode(),
            ConnectionValue::from(connection).encode(),
        )));
        ops.push(RecordOp::Put(Record::new(
            ListeningIndexKey {
                listening_key: connection.listening_key.clone(),
                connection_id: connection.connection_id.clone(),
            }
            .encode(),
            Bytes::new(),
        )));
        self.storage.apply(ops).await?;
        Ok(())
    }

    async fn deregister(&self, connection_id: &str) -> Result<bool> {
        let Some(existing) = self.storage.load_connection(connection_id).await? else {
            return Ok(false);
        };
        self.storage
            .apply(vec![
                RecordOp::Delete(
                    ListeningIndexKey {
                        listening_key: existing.listening_key,
                        connection_id: connection_id.to_string(),
                    }
                    .encode(),
                ),
                RecordOp::Delete(
                    ConnectionKey {
                        connection_id: connection_id.to_string(),
                    }
                    .encode(),
                ),
            ])
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> KeyphraseStorage {
        KeyphraseStorage::open(&StorageConfig::InMemory)
            .await
            .unwrap()
    }

    fn occurrence(site: &str, pathname: &str, keyphrase: &str, n: u64) -> OccurrenceRecord {
        OccurrenceRecord {
            site_key: site.to_string(),
            pathname: pathname.to_string(),
            keyphrase: keyphrase.to_string(),
            occurrences: n,
            aggregated: None,
        }
    }

    fn connection(id: &str, endpoint: &str, key: &str) -> Connection {
        Connection {
            connection_id: id.to_string(),
            callback_endpoint: endpoint.to_string(),
            listening_key: key.to_string(),
        }
    }

    fn delta(scope: TotalScope, keyphrase: &str, delta: i64) -> TotalDelta {
        TotalDelta {
            scope,
            keyphrase: keyphrase.to_string(),
            delta,
        }
    }

    #[tokio::test]
    async fn should_accumulate_total_deltas() {
        // given
        let storage = storage().await;
        let site = TotalScope::Site("example.com".to_string());

        // when
        storage
            .apply_total_deltas(&[delta(site.clone(), "widget", 5), delta(TotalScope::Global, "widget", 5)])
            .await
            .unwrap();
        storage
            .apply_total_deltas(&[delta(site.clone(), "widget", -2)])
            .await
            .unwrap();

        // then
        assert_eq!(storage.read_total(&site, "widget").await.unwrap(), 3);
        assert_eq!(
            storage.read_total(&TotalScope::Global, "widget").await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn should_read_site_pages_then_totals() {
        // given
        let storage = storage().await;
        storage
            .put_occurrences(&[
                occurrence("example.com", "/b", "widget", 2),
                occurrence("example.com", "/a", "widget", 1),
                occurrence("other.org", "/a", "widget", 9),
            ])
            .await
            .unwrap();
        storage
            .apply_total_deltas(&[delta(TotalScope::Site("example.com".to_string()), "widget", 3)])
            .await
            .unwrap();

        // when
        let rows = storage.read_site("example.com").await.unwrap();

        // then
        let summary: Vec<(&str, &str, u64)> = rows
            .iter()
            .map(|r| (r.pathname.as_str(), r.keyphrase.as_str(), r.occurrences))
            .collect();
        assert_eq!(
            summary,
            vec![("/a", "widget", 1), ("/b", "widget", 2), ("", "widget", 3)]
        );
        assert!(rows.iter().all(|r| r.listening_key == "example.com"));
    }

    #[tokio::test]
    async fn should_read_global_totals_under_total_marker() {
        // given
        let storage = storage().await;
        storage
            .apply_total_deltas(&[delta(TotalScope::Global, "widget", 4)])
            .await
            .unwrap();

        // when
        let rows = storage.read_site("TOTAL").await.unwrap();

        // then
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].occurrences, 4);
        assert_eq!(rows[0].pathname, "");
    }

    #[tokio::test]
    async fn should_return_empty_site_when_nothing_stored() {
        let storage = storage().await;
        assert!(storage.read_site("silent.example").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_reject_invalid_occurrences_without_writing() {
        // given
        let storage = storage().await;

        // when
        let result = storage
            .put_occurrences(&[
                occurrence("example.com", "/a", "widget", 1),
                occurrence("example.com", "/a#frag", "widget", 1),
            ])
            .await;

        // then
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(storage.read_site("example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_accept_counts_up_to_i64_max_only() {
        // given
        let storage = storage().await;

        // when
        let largest = storage
            .put_occurrences(&[occurrence("example.com", "/a", "widget", MAX_OCCURRENCES)])
            .await;
        let above = storage
            .put_occurrences(&[occurrence("example.com", "/b", "widget", MAX_OCCURRENCES + 1)])
            .await;

        // then
        assert!(largest.is_ok());
        assert!(matches!(above, Err(Error::InvalidInput(_))));
        let site = storage.read_site("example.com").await.unwrap();
        assert_eq!(site.len(), 1);
        assert_eq!(site[0].occurrences, MAX_OCCURRENCES);
    }

    #[tokio::test]
    async fn should_find_connections_by_listening_key() {
        // given
        let storage = storage().await;
        storage
            .register(&connection("c1", "wss://gw/x", "example.com"))
            .await
            .unwrap();
        storage
            .register(&connection("c2", "wss://gw/y", "example.com"))
            .await
            .unwrap();
        storage
            .register(&connection("c3", "wss://gw/x", "other.org"))
            .await
            .unwrap();

        // when
        let connections = storage.connections_for("example.com").await.unwrap();

        // then
        let ids: Vec<&str> = connections.iter().map(|c| c.connection_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn should_move_connection_when_reregistered_with_new_key() {
        // given
        let storage = storage().await;
        storage
            .register(&connection("c1", "wss://gw/x", "example.com"))
            .await
            .unwrap();

        // when
        storage
            .register(&connection("c1", "wss://gw/x", "other.org"))
            .await
            .unwrap();

        // then
        assert!(storage.connections_for("example.com").await.unwrap().is_empty());
        assert_eq!(storage.connections_for("other.org").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn should_deregister_connection() {
        // given
        let storage = storage().await;
        storage
            .register(&connection("c1", "wss://gw/x", "example.com"))
            .await
            .unwrap();

        // when
        let removed = storage.deregister("c1").await.unwrap();
        let removed_again = storage.deregister("c1").await.unwrap();

        // then
        assert!(removed);
        assert!(!removed_again);
        assert!(storage.connection("c1").await.unwrap().is_none());
        assert!(storage.connections_for("example.com").await.unwrap().is_empty());
    }
}
