//! Total aggregation engine.
//!
//! Turns page-level occurrence changes into signed deltas and applies them
//! to the site-scoped and global total rows. Deltas commute while no total
//! is clamped at zero, so records for one key may be applied in any order
//! across batches and still converge.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::change::{BatchResponse, ChangeRecord};
use crate::classify::{AggregationItem, OccurrenceItem, classify_aggregation};
use crate::error::{Error, Result};
use crate::model::{TotalDelta, TotalScope};
use crate::pipeline::BatchHandler;
use crate::traits::OccurrenceStore;

pub struct TotalAggregator {
    store: Arc<dyn OccurrenceStore>,
}

impl TotalAggregator {
    pub fn new(store: Arc<dyn OccurrenceStore>) -> Self {
        Self { store }
    }

    /// Applies the net change of `items` to their totals.
    ///
    /// Total rows are the output of this engine, so [`AggregationItem::Total`]
    /// entries are ignored. Returns false if the deltas overflow or the store
    /// rejected the write.
    pub async fn update_totals(&self, items: &[AggregationItem]) -> bool {
        self.apply_items(items).await.is_ok()
    }

    async fn apply_items(&self, items: &[AggregationItem]) -> Result<()> {
        let deltas = total_deltas(items.iter().filter_map(|item| match item {
            AggregationItem::Occurrence(item) => Some(item),
            AggregationItem::Total(_) => None,
        }))?;
        if deltas.is_empty() {
            return Ok(());
        }

        self.store
            .apply_total_deltas(&deltas)
            .await
            .inspect_err(|e| {
                tracing::warn!(error = %e, deltas = deltas.len(), "failed to apply total deltas");
            })
    }

    /// Aggregates one batch of change records, one store write per
    /// (site, keyphrase) pair. A failed write reports every record of its
    /// pair for retry; malformed records, and groups whose deltas overflow,
    /// are skipped.
    pub async fn process_batch(&self, records: &[ChangeRecord]) -> BatchResponse {
        let mut groups: BTreeMap<(String, String), (Vec<AggregationItem>, Vec<&str>)> =
            BTreeMap::new();
        for record in records {
            match classify_aggregation(record) {
                Ok(AggregationItem::Total(item)) => {
                    tracing::trace!(keyphrase = %item.keyphrase, "ignoring total row change");
                }
                Ok(AggregationItem::Occurrence(item)) => {
                    let (items, tokens) = groups
                        .entry((item.site_key.clone(), item.keyphrase.clone()))
                        .or_default();
                    items.push(AggregationItem::Occurrence(item));
                    tokens.push(record.sequence_token.as_str());
                }
                Err(e) => {
                    tracing::warn!(
                        sequence_token = %record.sequence_token,
                        error = %e,
                        "skipping malformed change record"
                    );
                }
            }
        }

        let group_count = groups.len();
        let failed = join_all(groups.into_iter().map(|((site_key, keyphrase), (items, tokens))| {
            async move {
                match self.apply_items(&items).await {
                    Ok(()) => Vec::new(),
                    Err(Error::InvalidInput(reason)) => {
                        tracing::warn!(
                            site_key = %site_key,
                            keyphrase = %keyphrase,
                            records = tokens.len(),
                            reason = %reason,
                            "skipping total group"
                        );
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!(
                            site_key = %site_key,
                            keyphrase = %keyphrase,
                            records = tokens.len(),
                            "total group failed"
                        );
                        tokens
                    }
                }
            }
        }))
        .await;

        let response = BatchResponse::from_tokens(failed.into_iter().flatten());
        tracing::debug!(
            records = records.len(),
            groups = group_count,
            failures = response.batch_item_failures.len(),
            "aggregated batch"
        );
        response
    }
}

/// Sums per-row deltas into one delta per (scope, keyphrase). Zero sums are
/// kept so the total rows still see a write. A sum leaving the `i64` range
/// is invalid input.
fn total_deltas<'a>(items: impl Iterator<Item = &'a OccurrenceItem>) -> Result<Vec<TotalDelta>> {
    let mut sums: BTreeMap<(TotalScope, &str), i64> = BTreeMap::new();
    for item in items {
        let delta = item.delta()?;
        for scope in [TotalScope::Site(item.site_key.clone()), TotalScope::Global] {
            let sum = sums.entry((scope, item.keyphrase.as_str())).or_default();
            *sum = sum.checked_add(delta).ok_or_else(|| {
                Error::InvalidInput(format!("total delta for {} overflows", item.keyphrase))
            })?;
        }
    }
    Ok(sums
        .into_iter()
        .map(|((scope, keyphrase), delta)| TotalDelta {
            scope,
            keyphrase: keyphrase.to_string(),
            delta,
        })
        .collect())
}

#[async_trait]
impl BatchHandler for TotalAggregator {
    type Record = ChangeRecord;

    fn name(&self) -> &'static str {
        "totals"
    }

    fn sequence_token(record: &ChangeRecord) -> &str {
        &record.sequence_token
    }

    async fn handle(&self, records: &[ChangeRecord]) -> BatchResponse {
        self.process_batch(records).await
    }
}
