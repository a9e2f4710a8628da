//! Prometheus metrics for the pipeline and its HTTP surface.

use axum::http::Method;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for per-consumer pipeline metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConsumerLabels {
    pub consumer: String,
}

impl ConsumerLabels {
    pub fn new(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
        }
    }
}

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabelsWithStatus {
    pub method: HttpMethod,
    pub endpoint: String,
    pub status: u16,
}

/// HTTP method label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::DELETE => HttpMethod::Delete,
            _ => HttpMethod::Other,
        }
    }
}

/// Container for all Prometheus metrics.
pub struct Metrics {
    registry: Registry,

    /// Records handed to each consumer, counted once per record.
    pub records_received_total: Family<ConsumerLabels, Counter>,

    /// Records a consumer's handler asked to have redelivered.
    pub batch_item_failures_total: Family<ConsumerLabels, Counter>,

    /// Records dropped after exhausting their delivery attempts.
    pub records_dropped_total: Family<ConsumerLabels, Counter>,

    /// Counter of HTTP requests.
    pub http_requests_total: Family<HttpLabelsWithStatus, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let records_received_total = Family::<ConsumerLabels, Counter>::default();
        registry.register(
            "keyphrase_records_received_total",
            "Total number of change records received per consumer",
            records_received_total.clone(),
        );

        let batch_item_failures_total = Family::<ConsumerLabels, Counter>::default();
        registry.register(
            "keyphrase_batch_item_failures_total",
            "Total number of batch item failures per consumer",
            batch_item_failures_total.clone(),
        );

        let records_dropped_total = Family::<ConsumerLabels, Counter>::default();
        registry.register(
            "keyphrase_records_dropped_total",
            "Total number of change records dropped after exhausting retries",
            records_dropped_total.clone(),
        );

        let http_requests_total = Family::<HttpLabelsWithStatus, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        Self {
            registry,
            records_received_total,
            batch_item_failures_total,
            records_dropped_total,
            http_requests_total,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buffer
    }
}
