//! Connection fan-out engine.
//!
//! Pushes occurrence and total changes to every live connection listening
//! on the changed site.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::change::{BatchResponse, ChangeRecord};
use crate::classify::classify_connection_update;
use crate::error::Result;
use crate::model::{BaseUrlOccurrenceUpdate, encode_payload};
use crate::pipeline::BatchHandler;
use crate::push::{ClientCache, PushClientFactory};
use crate::traits::ConnectionRegistry;

pub struct FanOut {
    registry: Arc<dyn ConnectionRegistry>,
    clients: Arc<dyn PushClientFactory>,
}

impl FanOut {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, clients: Arc<dyn PushClientFactory>) -> Self {
        Self { registry, clients }
    }

    /// Delivers `updates` to their listeners and returns those that could
    /// not be delivered.
    ///
    /// Updates are grouped by listening key: each group costs one registry
    /// lookup, one payload serialization and one push per connection. Any
    /// failure within a group fails the whole group and nothing else.
    pub async fn propagate(
        &self,
        updates: Vec<BaseUrlOccurrenceUpdate>,
    ) -> Vec<BaseUrlOccurrenceUpdate> {
        let mut groups: BTreeMap<String, Vec<BaseUrlOccurrenceUpdate>> = BTreeMap::new();
        for update in updates {
            groups
                .entry(update.listening_key.clone())
                .or_default()
                .push(update);
        }

        let cache = ClientCache::new(self.clients.as_ref());
        let cache = &cache;
        let failed = join_all(groups.into_iter().map(|(listening_key, updates)| async move {
            match self.deliver(cache, &listening_key, &updates).await {
                Ok(pushes) => {
                    tracing::trace!(listening_key = %listening_key, pushes, "delivered group");
                    Vec::new()
                }
                Err(e) => {
                    tracing::warn!(
                        listening_key = %listening_key,
                        updates = updates.len(),
                        error = %e,
                        "fan-out group failed"
                    );
                    updates
                }
            }
        }))
        .await;
        failed.into_iter().flatten().collect()
    }

    async fn deliver(
        &self,
        cache: &ClientCache<'_>,
        listening_key: &str,
        updates: &[BaseUrlOccurrenceUpdate],
    ) -> Result<usize> {
        let connections = self.registry.connections_for(listening_key).await?;
        if connections.is_empty() {
            return Ok(0);
        }

        let payload = encode_payload(updates)?;
        let sends = connections.iter().map(|connection| {
            let payload = payload.clone();
            async move {
                let client = cache.get_or_connect(&connection.callback_endpoint).await?;
                client
                    .send(std::slice::from_ref(&connection.connection_id), payload)
                    .await
            }
        });
        join_all(sends)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(connections.len())
    }

    /// Classifies a batch of store changes and pushes them. Records whose
    /// row belongs to a failed group are reported for retry; malformed
    /// records are skipped.
    pub async fn process_batch(&self, records: &[ChangeRecord]) -> BatchResponse {
        let mut pending: Vec<(&str, BaseUrlOccurrenceUpdate)> = Vec::with_capacity(records.len());
        for record in records {
            match classify_connection_update(record) {
                Ok(update) => pending.push((record.sequence_token.as_str(), update)),
                Err(e) => tracing::warn!(
                    sequence_token = %record.sequence_token,
                    error = %e,
                    "skipping malformed change record"
                ),
            }
        }

        let failed = self
            .propagate(pending.iter().map(|(_, update)| update.clone()).collect())
            .await;
        let response = BatchResponse::from_tokens(
            pending
                .iter()
                .filter(|(_, update)| failed.iter().any(|f| f.same_row(update)))
                .map(|(token, _)| *token),
        );
        tracing::debug!(
            records = records.len(),
            failures = response.batch_item_failures.len(),
            "fanned out batch"
        );
        response
    }
}

#[async_trait]
impl BatchHandler for FanOut {
    type Record = ChangeRecord;

    fn name(&self) -> &'static str {
        "fanout"
    }

    fn sequence_token(record: &ChangeRecord) -> &str {
        &record.sequence_token
    }

    async fn handle(&self, records: &[ChangeRecord]) -> BatchResponse {
        self.process_batch(records).await
    }
}
