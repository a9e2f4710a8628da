//! HTTP server for the keyphrase pipeline.
//!
//! Exposes the engines' batch invocation contract, the occurrence and
//! connection writes feeding the change feed, site snapshots, and the usual
//! metrics and health endpoints.

mod config;
mod error;
pub mod handlers;
mod http;
mod middleware;

pub use config::{CliArgs, ServerConfig};
pub use http::KeyphraseServer;
