//! Wiring of storage, engines and pipeline into one running service.

use std::sync::Arc;

use crate::aggregation::TotalAggregator;
use crate::bootstrap::SnapshotDispatcher;
use crate::config::Config;
use crate::error::Result;
use crate::fanout::FanOut;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::push::{HttpPushClientFactory, PushClientFactory};
use crate::storage::KeyphraseStorage;

/// A running keyphrase pipeline.
///
/// Owns the storage handle, one instance of each engine and the change
/// feed consumers driving them. Engines are shared so the HTTP batch
/// endpoints can invoke them directly as well.
pub struct KeyphraseService {
    storage: KeyphraseStorage,
    totals: Arc<TotalAggregator>,
    fanout: Arc<FanOut>,
    bootstrap: Arc<SnapshotDispatcher>,
    metrics: Arc<Metrics>,
    pipeline: Pipeline,
}

impl KeyphraseService {
    /// Opens storage and starts the pipeline, pushing over HTTP.
    pub async fn open(config: Config) -> Result<Self> {
        let clients = Arc::new(HttpPushClientFactory::new(config.push_timeout)?);
        Self::open_with_clients(config, clients).await
    }

    /// Opens storage and starts the pipeline with the given push transport.
    pub async fn open_with_clients(
        config: Config,
        clients: Arc<dyn PushClientFactory>,
    ) -> Result<Self> {
        let storage = KeyphraseStorage::open(&config.storage).await?;
        let store = Arc::new(storage.clone());

        let totals = Arc::new(TotalAggregator::new(store.clone()));
        let fanout = Arc::new(FanOut::new(store.clone(), clients.clone()));
        let bootstrap = Arc::new(SnapshotDispatcher::new(store, clients));
        let metrics = Arc::new(Metrics::new());

        let pipeline = Pipeline::spawn(
            storage.storage().as_ref(),
            totals.clone(),
            fanout.clone(),
            bootstrap.clone(),
            config.pipeline,
            metrics.clone(),
        )?;

        Ok(Self {
            storage,
            totals,
            fanout,
            bootstrap,
            metrics,
            pipeline,
        })
    }

    pub fn storage(&self) -> &KeyphraseStorage {
        &self.storage
    }

    pub fn totals(&self) -> &Arc<TotalAggregator> {
        &self.totals
    }

    pub fn fanout(&self) -> &Arc<FanOut> {
        &self.fanout
    }

    pub fn bootstrap(&self) -> &Arc<SnapshotDispatcher> {
        &self.bootstrap
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stops the pipeline after in-flight batches finish and flushes
    /// storage.
    pub async fn close(self) -> Result<()> {
        self.pipeline.shutdown().await;
        self.storage.storage().flush().await?;
        Ok(())
    }
}
