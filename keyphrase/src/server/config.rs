//! Configuration for the keyphrase HTTP server.

use std::time::Duration;

use clap::Parser;
use common::StorageConfig;

use crate::config::{Config, PipelineConfig};

/// CLI arguments for the keyphrase server.
#[derive(Debug, Parser)]
#[command(name = "keyphrase")]
#[command(about = "Keyphrase occurrence aggregation and live fan-out server")]
pub struct CliArgs {
    /// HTTP server port.
    #[arg(long, env = "KEYPHRASE_PORT", default_value = "8080")]
    pub port: u16,

    /// Maximum change records per batch handed to an engine.
    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    /// Milliseconds a consumer waits to fill a batch.
    #[arg(long, default_value = "50")]
    pub batch_window_ms: u64,

    /// Deliveries a change record gets before it is dropped.
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    /// Milliseconds to wait before redelivering failed records.
    #[arg(long, default_value = "100")]
    pub retry_delay_ms: u64,

    /// Timeout for each push to a subscriber endpoint, in milliseconds.
    #[arg(long, env = "KEYPHRASE_PUSH_TIMEOUT_MS", default_value = "5000")]
    pub push_timeout_ms: u64,
}

impl CliArgs {
    /// Convert CLI args to pipeline configuration.
    pub fn to_config(&self) -> Config {
        Config {
            storage: StorageConfig::InMemory,
            pipeline: PipelineConfig {
                batch_size: self.batch_size,
                batch_window: Duration::from_millis(self.batch_window_ms),
                max_attempts: self.max_attempts,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
            },
            push_timeout: Duration::from_millis(self.push_timeout_ms),
        }
    }
}

/// Configuration for the keyphrase HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl From<&CliArgs> for ServerConfig {
    fn from(args: &CliArgs) -> Self {
        Self { port: args.port }
    }
}
