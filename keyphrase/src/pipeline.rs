//! Batch delivery layer between the storage change feed and the engines.
//!
//! Every consumer holds its own change-feed subscription. A feed task
//! decodes the changes its consumer reads and queues them; the consumer
//! collects queued records into bounded batches, hands them to its
//! [`BatchHandler`] and redelivers the records named in the returned batch
//! item failures. Queues are unbounded, so a consumer stalled on a slow
//! dependency delays only its own records and never loses any.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Storage, StorageChange};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::change::{BatchResponse, ChangeRecord, ConnectionChangeRecord};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::feed::{FeedRecord, decode_change};
use crate::metrics::{ConsumerLabels, Metrics};

/// Processes one batch of change records.
///
/// Records missing from the response's failures count as durably
/// processed; listed ones are redelivered in a later batch.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    /// Consumer name used in logs and metrics.
    fn name(&self) -> &'static str;

    fn sequence_token(record: &Self::Record) -> &str;

    async fn handle(&self, records: &[Self::Record]) -> BatchResponse;
}

/// Running pipeline tasks.
pub struct Pipeline {
    feeds: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Subscribes each consumer to `storage`'s change feed and starts it.
    /// Occurrence and total changes go to both `totals` and `fanout`;
    /// connection changes go to `bootstrap`.
    pub fn spawn<T, F, B>(
        storage: &dyn Storage,
        totals: Arc<T>,
        fanout: Arc<F>,
        bootstrap: Arc<B>,
        config: PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self>
    where
        T: BatchHandler<Record = ChangeRecord>,
        F: BatchHandler<Record = ChangeRecord>,
        B: BatchHandler<Record = ConnectionChangeRecord>,
    {
        // subscribe all consumers before any task runs so they start from
        // the same point of the feed
        let totals_changes = storage.subscribe()?;
        let fanout_changes = storage.subscribe()?;
        let bootstrap_changes = storage.subscribe()?;

        let mut pipeline = Self {
            feeds: Vec::with_capacity(3),
            consumers: Vec::with_capacity(3),
        };
        pipeline.start(totals, totals_changes, occurrences, &config, &metrics);
        pipeline.start(fanout, fanout_changes, occurrences, &config, &metrics);
        pipeline.start(bootstrap, bootstrap_changes, connections, &config, &metrics);
        tracing::info!("started change feed pipeline");
        Ok(pipeline)
    }

    fn start<H: BatchHandler>(
        &mut self,
        handler: Arc<H>,
        changes: mpsc::UnboundedReceiver<StorageChange>,
        select: fn(FeedRecord) -> Option<H::Record>,
        config: &PipelineConfig,
        metrics: &Arc<Metrics>,
    ) {
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        self.feeds
            .push(tokio::spawn(feed(handler.name(), changes, select, records_tx)));
        self.consumers.push(tokio::spawn(consume(
            handler,
            records_rx,
            config.clone(),
            metrics.clone(),
        )));
    }

    /// Stops reading the change feed and waits for the consumers to finish
    /// the records they already received.
    pub async fn shutdown(self) {
        for feed in &self.feeds {
            feed.abort();
        }
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                tracing::error!(error = %e, "pipeline consumer panicked");
            }
        }
        tracing::info!("stopped change feed pipeline");
    }
}

fn occurrences(record: FeedRecord) -> Option<ChangeRecord> {
    match record {
        FeedRecord::Occurrence(record) => Some(record),
        FeedRecord::Connection(_) => None,
    }
}

fn connections(record: FeedRecord) -> Option<ConnectionChangeRecord> {
    match record {
        FeedRecord::Connection(record) => Some(record),
        FeedRecord::Occurrence(_) => None,
    }
}

/// Decodes one consumer's change subscription into its record queue.
async fn feed<R>(
    consumer: &'static str,
    mut changes: mpsc::UnboundedReceiver<StorageChange>,
    select: fn(FeedRecord) -> Option<R>,
    records: mpsc::UnboundedSender<R>,
) {
    while let Some(change) = changes.recv().await {
        let record = match decode_change(&change) {
            Ok(record) => record.and_then(select),
            Err(e) => {
                tracing::error!(consumer, sequence = change.sequence, error = %e, "undecodable change");
                None
            }
        };
        if let Some(record) = record
            && records.send(record).is_err()
        {
            break;
        }
    }
    tracing::debug!(consumer, "change feed stopped");
}

async fn consume<H: BatchHandler>(
    handler: Arc<H>,
    mut records: mpsc::UnboundedReceiver<H::Record>,
    config: PipelineConfig,
    metrics: Arc<Metrics>,
) {
    let labels = ConsumerLabels::new(handler.name());
    let batch_size = config.batch_size.max(1);
    // (record, deliveries so far)
    let mut redeliveries: VecDeque<(H::Record, u32)> = VecDeque::new();

    loop {
        let mut batch: Vec<(H::Record, u32)> = Vec::with_capacity(batch_size);
        while batch.len() < batch_size
            && let Some(entry) = redeliveries.pop_front()
        {
            batch.push(entry);
        }
        if batch.is_empty() {
            match records.recv().await {
                Some(record) => batch.push((record, 0)),
                None => break,
            }
        }

        let deadline = Instant::now() + config.batch_window;
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, records.recv()).await {
                Ok(Some(record)) => batch.push((record, 0)),
                Ok(None) | Err(_) => break,
            }
        }

        let fresh = batch.iter().filter(|(_, deliveries)| *deliveries == 0).count();
        metrics
            .records_received_total
            .get_or_create(&labels)
            .inc_by(fresh as u64);

        let input: Vec<H::Record> = batch.iter().map(|(record, _)| record.clone()).collect();
        let response = handler.handle(&input).await;
        if response.is_success() {
            continue;
        }

        let failed: HashSet<&str> = response.failed_tokens().collect();
        metrics
            .batch_item_failures_total
            .get_or_create(&labels)
            .inc_by(failed.len() as u64);
        for (record, deliveries) in batch {
            let token = H::sequence_token(&record);
            if !failed.contains(token) {
                continue;
            }
            let deliveries = deliveries + 1;
            if deliveries >= config.max_attempts {
                tracing::error!(
                    consumer = handler.name(),
                    sequence_token = token,
                    deliveries,
                    "dropping record after exhausting delivery attempts"
                );
                metrics.records_dropped_total.get_or_create(&labels).inc();
            } else {
                redeliveries.push_back((record, deliveries));
            }
        }
        if !redeliveries.is_empty() {
            tracing::debug!(
                consumer = handler.name(),
                pending = redeliveries.len(),
                "scheduling redelivery"
            );
            tokio::time::sleep(config.retry_delay).await;
        }
    }
    tracing::debug!(consumer = handler.name(), "pipeline consumer stopped");
}
