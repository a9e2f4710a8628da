//! Change-feed record shapes and the batch invocation contract.
//!
//! Records arrive either from the storage change feed (see [`crate::feed`])
//! or from an external delivery layer over HTTP. Field values are kept
//! loosely typed here so that one malformed record is rejected on its own
//! by the classifiers instead of failing the whole batch at decode time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Connection, MAX_OCCURRENCES, SORT_KEY_SEPARATOR};

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Modify,
    Remove,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Row image as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrences: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<Value>,
}

impl RawImage {
    pub fn new(occurrences: u64, aggregated: Option<bool>) -> Self {
        Self {
            occurrences: Some(Value::from(occurrences)),
            aggregated: aggregated.map(Value::from),
        }
    }
}

/// Validated row image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Image {
    pub occurrences: u64,
    pub aggregated: Option<bool>,
}

impl Image {
    /// Validates a wire image. Occurrences may be a non-negative integer up
    /// to [`MAX_OCCURRENCES`] or a string holding one.
    pub fn parse(raw: &RawImage) -> Result<Self> {
        let occurrences = match &raw.occurrences {
            None | Some(Value::Null) => {
                return Err(Error::InvalidInput("image missing occurrences".into()));
            }
            Some(value) => parse_occurrences(value)?,
        };
        let aggregated = match &raw.aggregated {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "aggregated is not a boolean: {}",
                    other
                )));
            }
        };
        Ok(Self {
            occurrences,
            aggregated,
        })
    }
}

fn parse_occurrences(value: &Value) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| *n <= MAX_OCCURRENCES)
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "occurrences is not an integer in 0..={}: {}",
                MAX_OCCURRENCES, value
            ))
        })
}

/// Splits a sort key into its two segments on the first separator.
pub fn split_sort_key(sort_key: &str) -> Option<(&str, &str)> {
    sort_key.split_once(SORT_KEY_SEPARATOR)
}

/// Builds a sort key from its two segments.
pub fn join_sort_key(head: &str, tail: &str) -> String {
    format!("{}{}{}", head, SORT_KEY_SEPARATOR, tail)
}

/// A row mutation of the occurrence/total store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    #[serde(default)]
    pub event_kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
    #[serde(default)]
    pub sequence_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<RawImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_image: Option<RawImage>,
}

impl ChangeRecord {
    pub(crate) fn keys(&self) -> Result<(&str, &str)> {
        let partition_key = self
            .partition_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::InvalidInput("record missing partition key".into()))?;
        let sort_key = self
            .sort_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::InvalidInput("record missing sort key".into()))?;
        Ok((partition_key, sort_key))
    }
}

/// Connection registry row as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionImage {
    #[serde(
        rename = "connectionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listening_key: Option<String>,
}

impl From<&Connection> for ConnectionImage {
    fn from(connection: &Connection) -> Self {
        Self {
            connection_id: Some(connection.connection_id.clone()),
            callback_endpoint: Some(connection.callback_endpoint.clone()),
            listening_key: Some(connection.listening_key.clone()),
        }
    }
}

/// A row mutation of the connection registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionChangeRecord {
    #[serde(default)]
    pub event_kind: EventKind,
    #[serde(default)]
    pub sequence_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<ConnectionImage>,
}

impl ConnectionChangeRecord {
    /// Extracts the newly registered connection.
    pub fn connection(&self) -> Result<Connection> {
        let image = self
            .new_image
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("connection record missing new image".into()))?;
        let field = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::InvalidInput(format!("connection record missing {}", name)))
        };
        Ok(Connection {
            connection_id: field(&image.connection_id, "connectionID")?,
            callback_endpoint: field(&image.callback_endpoint, "callbackEndpoint")?,
            listening_key: field(&image.listening_key, "listeningKey")?,
        })
    }
}

/// Input of a batch invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest<R> {
    pub records: Vec<R>,
}

/// A record whose processing the delivery layer must retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Output of a batch invocation. Records not listed were durably processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    /// Builds a response from sequence tokens, dropping duplicates while
    /// keeping first-seen order.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut batch_item_failures: Vec<BatchItemFailure> = Vec::new();
        for token in tokens {
            let item_identifier = token.into();
            if seen.insert(item_identifier.clone()) {
                batch_item_failures.push(BatchItemFailure { item_identifier });
            }
        }
        Self {
            batch_item_failures,
        }
    }

    pub fn is_success(&self) -> bool {
        self.batch_item_failures.is_empty()
    }

    pub fn failed_tokens(&self) -> impl Iterator<Item = &str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
    }
}
