//! Runtime configuration for the keyphrase pipeline.

use std::time::Duration;

use common::StorageConfig;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    /// Timeout applied to each push request.
    pub push_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::InMemory,
            pipeline: PipelineConfig::default(),
            push_timeout: Duration::from_secs(5),
        }
    }
}

/// Batching and redelivery settings shared by the pipeline consumers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum records per handler invocation.
    pub batch_size: usize,
    /// How long a consumer keeps collecting after the first record of a
    /// batch arrives.
    pub batch_window: Duration,
    /// Deliveries a record gets before it is dropped.
    pub max_attempts: u32,
    /// Pause before a batch containing redeliveries.
    pub retry_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_window: Duration::from_millis(50),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}
