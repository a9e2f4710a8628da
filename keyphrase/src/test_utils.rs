//! Fakes shared by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{BaseUrlOccurrenceUpdate, Connection, TotalDelta};
use crate::push::{PushClient, PushClientFactory};
use crate::traits::{ConnectionRegistry, OccurrenceStore};

/// A push delivered through [`RecordingPushFactory`].
#[derive(Debug, Clone)]
pub(crate) struct SentPush {
    pub endpoint: String,
    pub recipients: Vec<String>,
    pub payload: Bytes,
}

impl SentPush {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
struct PushState {
    connects: HashMap<String, usize>,
    pending_connect_failures: HashMap<String, usize>,
    failing_endpoints: HashSet<String>,
    failing_recipients: HashSet<String>,
    sends: Vec<SentPush>,
}

/// Push factory that records every client it creates and every push sent.
#[derive(Default, Clone)]
pub(crate) struct RecordingPushFactory {
    state: Arc<Mutex<PushState>>,
}

impl RecordingPushFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` connects to `endpoint`.
    pub fn fail_connects_to(&self, endpoint: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .pending_connect_failures
            .insert(endpoint.to_string(), times);
    }

    /// Fails every send through clients for `endpoint`.
    pub fn fail_sends_to(&self, endpoint: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_endpoints
            .insert(endpoint.to_string());
    }

    /// Fails every send that includes `connection_id` as a recipient.
    pub fn fail_sends_for(&self, connection_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_recipients
            .insert(connection_id.to_string());
    }

    /// Successful connects to `endpoint`.
    pub fn connects(&self, endpoint: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.state.lock().unwrap().connects.values().sum()
    }

    /// Successful sends, in completion order.
    pub fn sends(&self) -> Vec<SentPush> {
        self.state.lock().unwrap().sends.clone()
    }
}

#[async_trait]
impl PushClientFactory for RecordingPushFactory {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PushClient>> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.pending_connect_failures.get_mut(endpoint)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Transport(format!("connect to {} refused", endpoint)));
        }
        *state.connects.entry(endpoint.to_string()).or_default() += 1;
        Ok(Arc::new(RecordingPushClient {
            endpoint: endpoint.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct RecordingPushClient {
    endpoint: String,
    state: Arc<Mutex<PushState>>,
}

#[async_trait]
impl PushClient for RecordingPushClient {
    async fn send(&self, recipients: &[String], payload: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_endpoints.contains(&self.endpoint)
            || recipients
                .iter()
                .any(|r| state.failing_recipients.contains(r))
        {
            return Err(Error::Transport(format!("send to {} failed", self.endpoint)));
        }
        state.sends.push(SentPush {
            endpoint: self.endpoint.clone(),
            recipients: recipients.to_vec(),
            payload,
        });
        Ok(())
    }
}

/// In-memory registry with per-key failure injection.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    connections: Mutex<Vec<Connection>>,
    failing_keys: Mutex<HashSet<String>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn with_connections(connections: Vec<Connection>) -> Self {
        Self {
            connections: Mutex::new(connections),
            ..Default::default()
        }
    }

    pub fn fail_lookups_for(&self, listening_key: &str) {
        self.failing_keys
            .lock()
            .unwrap()
            .insert(listening_key.to_string());
    }

    /// Listening keys looked up so far.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionRegistry for FakeRegistry {
    async fn connections_for(&self, listening_key: &str) -> Result<Vec<Connection>> {
        self.lookups.lock().unwrap().push(listening_key.to_string());
        if self.failing_keys.lock().unwrap().contains(listening_key) {
            return Err(Error::Storage(format!("lookup of {} failed", listening_key)));
        }
        Ok(self
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.listening_key == listening_key)
            .cloned()
            .collect())
    }

    async fn register(&self, connection: &Connection) -> Result<()> {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| c.connection_id != connection.connection_id);
        connections.push(connection.clone());
        Ok(())
    }

    async fn deregister(&self, connection_id: &str) -> Result<bool> {
        let mut connections = self.connections.lock().unwrap();
        let before = connections.len();
        connections.retain(|c| c.connection_id != connection_id);
        Ok(connections.len() != before)
    }
}

/// Store fake that records applied delta batches and serves canned site
/// reads.
#[derive(Default)]
pub(crate) struct FakeStore {
    sites: Mutex<HashMap<String, Vec<BaseUrlOccurrenceUpdate>>>,
    applied: Mutex<Vec<Vec<TotalDelta>>>,
    failing_keyphrases: Mutex<HashSet<String>>,
    failing_sites: Mutex<HashSet<String>>,
    reads: Mutex<Vec<String>>,
}

impl FakeStore {
    pub fn with_site(self, listening_key: &str, rows: Vec<BaseUrlOccurrenceUpdate>) -> Self {
        self.sites
            .lock()
            .unwrap()
            .insert(listening_key.to_string(), rows);
        self
    }

    /// Fails any delta batch touching `keyphrase`.
    pub fn fail_writes_for(&self, keyphrase: &str) {
        self.failing_keyphrases
            .lock()
            .unwrap()
            .insert(keyphrase.to_string());
    }

    pub fn fail_reads_for(&self, listening_key: &str) {
        self.failing_sites
            .lock()
            .unwrap()
            .insert(listening_key.to_string());
    }

    /// Delta batches applied so far, one entry per store call.
    pub fn applied(&self) -> Vec<Vec<TotalDelta>> {
        self.applied.lock().unwrap().clone()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl OccurrenceStore for FakeStore {
    async fn apply_total_deltas(&self, deltas: &[TotalDelta]) -> Result<()> {
        let failing = self.failing_keyphrases.lock().unwrap();
        if deltas.iter().any(|d| failing.contains(&d.keyphrase)) {
            return Err(Error::Storage("conditional write failed".to_string()));
        }
        self.applied.lock().unwrap().push(deltas.to_vec());
        Ok(())
    }

    async fn read_site(&self, listening_key: &str) -> Result<Vec<BaseUrlOccurrenceUpdate>> {
        self.reads.lock().unwrap().push(listening_key.to_string());
        if self.failing_sites.lock().unwrap().contains(listening_key) {
            return Err(Error::Storage(format!("read of {} failed", listening_key)));
        }
        Ok(self
            .sites
            .lock()
            .unwrap()
            .get(listening_key)
            .cloned()
            .unwrap_or_default())
    }
}

pub(crate) fn connection(id: &str, endpoint: &str, listening_key: &str) -> Connection {
    Connection {
        connection_id: id.to_string(),
        callback_endpoint: endpoint.to_string(),
        listening_key: listening_key.to_string(),
    }
}

pub(crate) fn update(
    listening_key: &str,
    pathname: &str,
    keyphrase: &str,
    occurrences: u64,
) -> BaseUrlOccurrenceUpdate {
    BaseUrlOccurrenceUpdate {
        listening_key: listening_key.to_string(),
        pathname: pathname.to_string(),
        keyphrase: keyphrase.to_string(),
        occurrences,
    }
}
