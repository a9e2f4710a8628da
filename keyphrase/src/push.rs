//! Push transport to subscriber endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use tokio::sync::OnceCell;

use crate::error::{Error, Result};

/// Header carrying the comma-separated recipient connection IDs.
pub const CONNECTION_IDS_HEADER: &str = "x-connection-ids";

/// Client bound to one delivery endpoint.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Delivers `payload` to every connection in `recipients` as one push.
    async fn send(&self, recipients: &[String], payload: Bytes) -> Result<()>;
}

/// Creates push clients for delivery endpoints.
#[async_trait]
pub trait PushClientFactory: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PushClient>>;
}

type Slot = Arc<OnceCell<Arc<dyn PushClient>>>;

/// Per-invocation cache of push clients keyed by endpoint.
///
/// Owned by a single batch invocation and dropped with it. Concurrent
/// callers asking for the same endpoint share one `connect`; a failed
/// `connect` leaves the slot empty so a later caller may try again.
pub struct ClientCache<'a> {
    factory: &'a dyn PushClientFactory,
    slots: DashMap<String, Slot>,
}

impl<'a> ClientCache<'a> {
    pub fn new(factory: &'a dyn PushClientFactory) -> Self {
        Self {
            factory,
            slots: DashMap::new(),
        }
    }

    pub async fn get_or_connect(&self, endpoint: &str) -> Result<Arc<dyn PushClient>> {
        let slot: Slot = self.slots.entry(endpoint.to_string()).or_default().clone();
        slot.get_or_try_init(|| self.factory.connect(endpoint))
            .await
            .cloned()
    }
}

/// Pushes over HTTP.
///
/// WebSocket gateway endpoints (`ws://`, `wss://`) are addressed through
/// their HTTP management side on the same host and path.
pub struct HttpPushClientFactory {
    client: reqwest::Client,
}

impl HttpPushClientFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushClientFactory for HttpPushClientFactory {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PushClient>> {
        let url = push_url(endpoint)?;
        tracing::debug!(endpoint = %url, "created push client");
        Ok(Arc::new(HttpPushClient {
            client: self.client.clone(),
            url,
        }))
    }
}

fn push_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::InvalidInput(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            return Err(Error::InvalidInput(format!(
                "unsupported endpoint scheme: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Internal(format!("cannot rewrite scheme of {}", endpoint)))?;
    Ok(url)
}

struct HttpPushClient {
    client: reqwest::Client,
    url: Url,
}

#[async_trait]
impl PushClient for HttpPushClient {
    async fn send(&self, recipients: &[String], payload: Bytes) -> Result<()> {
        let recipients_header = HeaderValue::from_str(&recipients.join(","))
            .map_err(|e| Error::InvalidInput(format!("invalid connection id: {}", e)))?;
        self.client
            .post(self.url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(CONNECTION_IDS_HEADER, recipients_header)
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
