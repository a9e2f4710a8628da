//! New-connection snapshot dispatcher.
//!
//! Sends a freshly registered connection the current state of the site it
//! listens on, so it does not have to wait for the next change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::change::{BatchResponse, ConnectionChangeRecord, EventKind};
use crate::error::Result;
use crate::model::{Connection, encode_payload};
use crate::pipeline::BatchHandler;
use crate::push::{ClientCache, PushClientFactory};
use crate::traits::OccurrenceStore;

/// Connection IDs sharing one listening key, keyed by callback endpoint.
type EndpointGroups<'a> = BTreeMap<&'a str, Vec<&'a str>>;

pub struct SnapshotDispatcher {
    store: Arc<dyn OccurrenceStore>,
    clients: Arc<dyn PushClientFactory>,
}

impl SnapshotDispatcher {
    pub fn new(store: Arc<dyn OccurrenceStore>, clients: Arc<dyn PushClientFactory>) -> Self {
        Self { store, clients }
    }

    /// Sends the snapshot to a single connection. Returns its ID if the
    /// snapshot could not be delivered.
    pub async fn bootstrap_connection(&self, connection: &Connection) -> Vec<String> {
        self.bootstrap(std::slice::from_ref(connection)).await
    }

    /// Sends snapshots to `connections` and returns the IDs that failed.
    ///
    /// Each listening key is read once. Connections sharing a listening key
    /// and endpoint receive one push addressed to all of them. A site with
    /// no rows gets no push and no client.
    pub async fn bootstrap(&self, connections: &[Connection]) -> Vec<String> {
        let mut by_key: BTreeMap<&str, EndpointGroups<'_>> = BTreeMap::new();
        for connection in connections {
            let ids = by_key
                .entry(connection.listening_key.as_str())
                .or_default()
                .entry(connection.callback_endpoint.as_str())
                .or_default();
            if !ids.contains(&connection.connection_id.as_str()) {
                ids.push(connection.connection_id.as_str());
            }
        }

        let cache = ClientCache::new(self.clients.as_ref());
        let cache = &cache;
        let failed = join_all(
            by_key
                .into_iter()
                .map(|(listening_key, endpoints)| async move {
                    self.bootstrap_key(cache, listening_key, endpoints).await
                }),
        )
        .await;
        failed
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect()
    }

    async fn bootstrap_key<'a>(
        &self,
        cache: &ClientCache<'_>,
        listening_key: &str,
        endpoints: EndpointGroups<'a>,
    ) -> Vec<&'a str> {
        let payload = match self.snapshot(listening_key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!(listening_key, "no stored rows, skipping snapshot");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(listening_key, error = %e, "failed to read snapshot");
                return endpoints.into_values().flatten().collect();
            }
        };

        let sends = endpoints.into_iter().map(|(endpoint, ids)| {
            let payload = payload.clone();
            async move {
                let recipients: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                let result: Result<()> = async {
                    let client = cache.get_or_connect(endpoint).await?;
                    client.send(&recipients, payload).await
                }
                .await;
                match result {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(
                            listening_key,
                            endpoint,
                            connections = ids.len(),
                            error = %e,
                            "failed to send snapshot"
                        );
                        ids
                    }
                }
            }
        });
        join_all(sends).await.into_iter().flatten().collect()
    }

    async fn snapshot(&self, listening_key: &str) -> Result<Option<bytes::Bytes>> {
        let rows = self.store.read_site(listening_key).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(encode_payload(&rows)?))
    }

    /// Bootstraps the connections inserted in a batch of registry changes.
    /// Modifications and removals need no snapshot.
    pub async fn process_batch(&self, records: &[ConnectionChangeRecord]) -> BatchResponse {
        let mut pending: Vec<(&str, Connection)> = Vec::with_capacity(records.len());
        for record in records {
            match record.event_kind {
                EventKind::Insert => {}
                EventKind::Modify | EventKind::Remove => continue,
                EventKind::Unknown => {
                    tracing::warn!(
                        sequence_token = %record.sequence_token,
                        "skipping connection record with unrecognized event kind"
                    );
                    continue;
                }
            }
            match record.connection() {
                Ok(connection) => pending.push((record.sequence_token.as_str(), connection)),
                Err(e) => tracing::warn!(
                    sequence_token = %record.sequence_token,
                    error = %e,
                    "skipping malformed connection record"
                ),
            }
        }

        let connections: Vec<Connection> = pending.iter().map(|(_, c)| c.clone()).collect();
        let failed = self.bootstrap(&connections).await;
        let response = BatchResponse::from_tokens(
            pending
                .iter()
                .filter(|(_, c)| failed.contains(&c.connection_id))
                .map(|(token, _)| *token),
        );
        tracing::debug!(
            records = records.len(),
            connections = connections.len(),
            failures = response.batch_item_failures.len(),
            "bootstrapped batch"
        );
        response
    }
}

#[async_trait]
impl BatchHandler for SnapshotDispatcher {
    type Record = ConnectionChangeRecord;

    fn name(&self) -> &'static str {
        "bootstrap"
    }

    fn sequence_token(record: &ConnectionChangeRecord) -> &str {
        &record.sequence_token
    }

    async fn handle(&self, records: &[ConnectionChangeRecord]) -> BatchResponse {
        self.process_batch(records).await
    }
}
