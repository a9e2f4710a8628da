//! Keyphrase occurrence aggregation and live fan-out.
//!
//! Page-level keyphrase counts are written to storage; every write shows up
//! on the storage change feed, where three consumers pick it up:
//!
//! - [`TotalAggregator`] folds occurrence deltas into per-site and global
//!   totals.
//! - [`FanOut`] pushes changed rows to the connections listening on the
//!   site.
//! - [`SnapshotDispatcher`] sends a newly registered connection the current
//!   state of its site.
//!
//! The engines depend only on the ports in [`traits`] and [`push`];
//! [`KeyphraseStorage`] implements the storage ports over
//! [`common::Storage`].

mod aggregation;
mod bootstrap;
pub mod change;
pub mod classify;
mod config;
mod error;
mod fanout;
pub mod feed;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod push;
pub mod serde;
pub mod server;
mod service;
mod storage;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod traits;

pub use aggregation::TotalAggregator;
pub use bootstrap::SnapshotDispatcher;
pub use config::{Config, PipelineConfig};
pub use error::{Error, Result};
pub use fanout::FanOut;
pub use service::KeyphraseService;
pub use storage::KeyphraseStorage;
