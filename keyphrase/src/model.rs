//! Core data types for keyphrase aggregation and fan-out.

use serde::{Deserialize, Serialize};

/// Reserved key marker identifying total rows.
///
/// As a partition key it addresses the global totals; as the first segment
/// of a sort key it addresses the totals of the partition's site. Page-level
/// pathnames always start with `/`, so the marker cannot collide with one.
pub const TOTAL_MARKER: &str = "TOTAL";

/// Largest occurrence count a row may hold. Counts stay within `i64` so
/// that the difference of any two is a representable delta.
pub const MAX_OCCURRENCES: u64 = i64::MAX as u64;

/// Separates the two segments of a sort key (`<pathname>#<keyphrase>` or
/// `TOTAL#<keyphrase>`). Only the first occurrence splits; keyphrases may
/// contain the separator.
pub const SORT_KEY_SEPARATOR: char = '#';

/// Which rollup a total row belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TotalScope {
    Global,
    Site(String),
}

impl TotalScope {
    /// The partition key total rows of this scope are stored under.
    pub fn partition_key(&self) -> &str {
        match self {
            TotalScope::Global => TOTAL_MARKER,
            TotalScope::Site(site_key) => site_key,
        }
    }

    pub fn from_partition_key(partition_key: &str) -> Self {
        if partition_key == TOTAL_MARKER {
            TotalScope::Global
        } else {
            TotalScope::Site(partition_key.to_string())
        }
    }
}

/// A keyphrase found on one page of one site.
///
/// Unique per (site_key, pathname, keyphrase). Written by the extraction
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrenceRecord {
    pub site_key: String,
    pub pathname: String,
    pub keyphrase: String,
    pub occurrences: u64,
    /// Reserved for incremental-aggregation bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<bool>,
}

/// Rollup of occurrences for one keyphrase, site-scoped or global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_key: Option<String>,
    pub keyphrase: String,
    pub occurrences: u64,
}

impl TotalRecord {
    pub fn scope(&self) -> TotalScope {
        match &self.site_key {
            Some(site_key) => TotalScope::Site(site_key.clone()),
            None => TotalScope::Global,
        }
    }
}

/// A live subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    /// Address the push client delivers to.
    pub callback_endpoint: String,
    /// Site the subscriber wants updates for.
    pub listening_key: String,
}

/// Normalized row change handed from the connection update classifier to
/// the fan-out engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseUrlOccurrenceUpdate {
    pub listening_key: String,
    /// Empty for total rows.
    pub pathname: String,
    pub keyphrase: String,
    pub occurrences: u64,
}

impl BaseUrlOccurrenceUpdate {
    pub fn payload(&self) -> OccurrencePayload {
        OccurrencePayload {
            pathname: self.pathname.clone(),
            keyphrase: self.keyphrase.clone(),
            occurrences: self.occurrences,
        }
    }

    /// Whether both describe the same stored row.
    pub fn same_row(&self, other: &BaseUrlOccurrenceUpdate) -> bool {
        self.listening_key == other.listening_key
            && self.pathname == other.pathname
            && self.keyphrase == other.keyphrase
    }
}

/// One element of the JSON array pushed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrencePayload {
    pub pathname: String,
    pub keyphrase: String,
    pub occurrences: u64,
}

/// Serializes a push payload: a JSON array of `{pathname, keyphrase,
/// occurrences}` objects.
pub fn encode_payload(updates: &[BaseUrlOccurrenceUpdate]) -> crate::Result<bytes::Bytes> {
    let payload: Vec<OccurrencePayload> = updates.iter().map(|u| u.payload()).collect();
    Ok(bytes::Bytes::from(serde_json::to_vec(&payload)?))
}

/// Signed change to apply to one total row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalDelta {
    pub scope: TotalScope,
    pub keyphrase: String,
    pub delta: i64,
}
