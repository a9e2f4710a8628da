//! Storage layout for occurrence, total and connection rows.
//!
//! # Key Format
//!
//! All keys start with a version byte and record type discriminator,
//! followed by [`terminated_bytes`] segments:
//!
//! ```text
//! | version (u8) | type (u8) | segment | segment | ... |
//! ```
//!
//! | Record            | Type | Segments                         |
//! |-------------------|------|----------------------------------|
//! | Occurrence        | 0x01 | site key, pathname, keyphrase    |
//! | Total             | 0x02 | scope (site key or `TOTAL`), keyphrase |
//! | Connection        | 0x03 | connection ID                    |
//! | Listening index   | 0x04 | listening key, connection ID     |
//!
//! Terminated segments make every leading run of segments an exact-match
//! scan prefix, so all rows of one site (or all connections listening on
//! one key) are a single range scan.

use bytes::{BufMut, Bytes, BytesMut};
use common::BytesRange;
use common::serde::terminated_bytes;

use crate::error::{Error, Result};
use crate::model::{Connection, TotalScope};

/// Key format version (currently 0x01)
pub const KEY_VERSION: u8 = 0x01;

/// Record type discriminators for keyphrase storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Occurrence = 0x01,
    Total = 0x02,
    Connection = 0x03,
    ListeningIndex = 0x04,
}

impl RecordType {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(RecordType::Occurrence),
            0x02 => Ok(RecordType::Total),
            0x03 => Ok(RecordType::Connection),
            0x04 => Ok(RecordType::ListeningIndex),
            _ => Err(Error::Encoding(format!(
                "invalid record type: 0x{:02x}",
                id
            ))),
        }
    }

    /// Reads the record type of a stored key.
    pub fn of_key(key: &[u8]) -> Result<Self> {
        if key.len() < 2 {
            return Err(Error::Encoding("buffer too short for key header".to_string()));
        }
        if key[0] != KEY_VERSION {
            return Err(Error::Encoding(format!(
                "invalid key version: expected 0x{:02x}, got 0x{:02x}",
                KEY_VERSION, key[0]
            )));
        }
        Self::from_id(key[1])
    }
}

fn key_prefix(record_type: RecordType, segments: &[&str]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(KEY_VERSION);
    buf.put_u8(record_type.id());
    for segment in segments {
        terminated_bytes::serialize(segment.as_bytes(), &mut buf);
    }
    buf
}

/// Decodes the segments following a key header of the expected type.
fn key_segments<const N: usize>(data: &[u8], expected: RecordType) -> Result<[String; N]> {
    let record_type = RecordType::of_key(data)?;
    if record_type != expected {
        return Err(Error::Encoding(format!(
            "invalid record type: expected {:?}, got {:?}",
            expected, record_type
        )));
    }
    let mut buf = &data[2..];
    let mut segments: [String; N] = std::array::from_fn(|_| String::new());
    for segment in segments.iter_mut() {
        let raw = terminated_bytes::deserialize(&mut buf)?;
        *segment = String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Encoding(format!("key segment is not utf-8: {}", e)))?;
    }
    if !buf.is_empty() {
        return Err(Error::Encoding(format!(
            "{} trailing bytes after {:?} key",
            buf.len(),
            expected
        )));
    }
    Ok(segments)
}

/// Key of a page-level occurrence row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceKey {
    pub site_key: String,
    pub pathname: String,
    pub keyphrase: String,
}

impl OccurrenceKey {
    pub fn encode(&self) -> Bytes {
        key_prefix(
            RecordType::Occurrence,
            &[&self.site_key, &self.pathname, &self.keyphrase],
        )
        .freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let [site_key, pathname, keyphrase] = key_segments::<3>(data, RecordType::Occurrence)?;
        Ok(Self {
            site_key,
            pathname,
            keyphrase,
        })
    }

    /// Range covering every occurrence row of one site.
    pub fn site_range(site_key: &str) -> BytesRange {
        BytesRange::prefix(key_prefix(RecordType::Occurrence, &[site_key]).freeze())
    }
}

/// Key of a total row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalKey {
    pub scope: TotalScope,
    pub keyphrase: String,
}

impl TotalKey {
    pub fn encode(&self) -> Bytes {
        key_prefix(
            RecordType::Total,
            &[self.scope.partition_key(), &self.keyphrase],
        )
        .freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let [partition_key, keyphrase] = key_segments::<2>(data, RecordType::Total)?;
        Ok(Self {
            scope: TotalScope::from_partition_key(&partition_key),
            keyphrase,
        })
    }

    /// Range covering every total row stored under one partition key.
    pub fn partition_range(partition_key: &str) -> BytesRange {
        BytesRange::prefix(key_prefix(RecordType::Total, &[partition_key]).freeze())
    }
}

/// Key of a connection registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub connection_id: String,
}

impl ConnectionKey {
    pub fn encode(&self) -> Bytes {
        key_prefix(RecordType::Connection, &[&self.connection_id]).freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let [connection_id] = key_segments::<1>(data, RecordType::Connection)?;
        Ok(Self { connection_id })
    }
}

/// Secondary index entry locating a connection by its listening key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningIndexKey {
    pub listening_key: String,
    pub connection_id: String,
}

impl ListeningIndexKey {
    pub fn encode(&self) -> Bytes {
        key_prefix(
            RecordType::ListeningIndex,
            &[&self.listening_key, &self.connection_id],
        )
        .freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let [listening_key, connection_id] = key_segments::<2>(data, RecordType::ListeningIndex)?;
        Ok(Self {
            listening_key,
            connection_id,
        })
    }

    pub fn listening_range(listening_key: &str) -> BytesRange {
        BytesRange::prefix(key_prefix(RecordType::ListeningIndex, &[listening_key]).freeze())
    }
}

const AGGREGATED_UNSET: u8 = 0;
const AGGREGATED_FALSE: u8 = 1;
const AGGREGATED_TRUE: u8 = 2;

/// Value of an occurrence row.
///
/// ```text
/// | occurrences (u64 BE) | aggregated (u8: 0 unset, 1 false, 2 true) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccurrenceValue {
    pub occurrences: u64,
    pub aggregated: Option<bool>,
}

impl OccurrenceValue {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64(self.occurrences);
        buf.put_u8(match self.aggregated {
            None => AGGREGATED_UNSET,
            Some(false) => AGGREGATED_FALSE,
            Some(true) => AGGREGATED_TRUE,
        });
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let Ok(bytes) = <[u8; 9]>::try_from(data) else {
            return Err(Error::Encoding(format!(
                "occurrence value must be 9 bytes, got {}",
                data.len()
            )));
        };
        let occurrences = u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        let aggregated = match bytes[8] {
            AGGREGATED_UNSET => None,
            AGGREGATED_FALSE => Some(false),
            AGGREGATED_TRUE => Some(true),
            other => {
                return Err(Error::Encoding(format!(
                    "invalid aggregated flag: 0x{:02x}",
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

/// Value of a total row, and also the operand merged into it.
///
/// Stored totals are never negative; operands are signed deltas.
///
/// ```text
/// | count (i64 BE) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalValue {
    pub count: i64,
}

impl TotalValue {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.count.to_be_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let bytes = <[u8; 8]>::try_from(data).map_err(|_| {
            Error::Encoding(format!("total value must be 8 bytes, got {}", data.len()))
        })?;
        Ok(Self {
            count: i64::from_be_bytes(bytes),
        })
    }

    pub fn occurrences(&self) -> u64 {
        self.count.max(0) as u64
    }
}

/// Value of a connection row.
///
/// ```text
/// | terminated callback endpoint | terminated listening key |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionValue {
    pub callback_endpoint: String,
    pub listening_key: String,
}

impl ConnectionValue {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        terminated_bytes::serialize(self.callback_endpoint.as_bytes(), &mut buf);
        terminated_bytes::serialize(self.listening_key.as_bytes(), &mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let callback_endpoint = utf8(terminated_bytes::deserialize(&mut buf)?)?;
        let listening_key = utf8(terminated_bytes::deserialize(&mut buf)?)?;
        Ok(Self {
            callback_endpoint,
            listening_key,
        })
    }

    pub fn into_connection(self, connection_id: String) -> Connection {
        Connection {
            connection_id,
            callback_endpoint: self.callback_endpoint,
            listening_key: self.listening_key,
        }
    }
}

impl From<&Connection> for ConnectionValue {
    fn from(connection: &Connection) -> Self {
        Self {
            callback_endpoint: connection.callback_endpoint.clone(),
            listening_key: connection.listening_key.clone(),
        }
    }
}

fn utf8(raw: Bytes) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::Encoding(format!("value is not utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::ops::RangeBounds;

    use super::*;

    #[test]
    fn should_decode_occurrence_key() {
        // given
        let key = OccurrenceKey {
            site_key: "example.com".to_string(),
            pathname: "/a".to_string(),
            keyphrase: "blue widget".to_string(),
        };

        // when
        let decoded = OccurrenceKey::decode(&key.encode()).unwrap();

        // then
        assert_eq!(decoded, key);
    }

    #[test]
    fn should_scope_site_range_to_exact_site() {
        // given
        let range = OccurrenceKey::site_range("example.com");
        let inside = OccurrenceKey {
            site_key: "example.com".to_string(),
            pathname: "/a".to_string(),
            keyphrase: "w".to_string(),
        };
        let longer_site = OccurrenceKey {
            site_key: "example.com.au".to_string(),
            pathname: "/a".to_string(),
            keyphrase: "w".to_string(),
        };

        // when/then
        assert!(range.contains(&inside.encode()));
        assert!(!range.contains(&longer_site.encode()));
    }

    #[test]
    fn should_store_global_totals_under_total_marker() {
        // given
        let key = TotalKey {
            scope: TotalScope::Global,
            keyphrase: "widget".to_string(),
        };

        // when
        let encoded = key.encode();

        // then
        assert!(TotalKey::partition_range("TOTAL").contains(&encoded));
        assert_eq!(TotalKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn should_reject_key_of_other_record_type() {
        // given
        let key = ConnectionKey {
            connection_id: "c1".to_string(),
        }
        .encode();

        // when
        let result = OccurrenceKey::decode(&key);

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn should_reject_unknown_key_version() {
        let result = RecordType::of_key(&[0x09, 0x01]);
        assert!(matches!(result, Err(Error::Encoding(msg)) if msg.contains("version")));
    }

    #[test]
    fn should_decode_occurrence_value_with_flag() {
        // given
        let value = OccurrenceValue {
            occurrences: 12,
            aggregated: Some(true),
        };

        // when
        let decoded = OccurrenceValue::decode(&value.encode()).unwrap();

        // then
        assert_eq!(decoded, value);
    }

    #[test]
    fn should_clamp_negative_total_to_zero_occurrences() {
        // given
        let value = TotalValue { count: -4 };

        // when
        let decoded = TotalValue::decode(&value.encode()).unwrap();

        // then
        assert_eq!(decoded.count, -4);
        assert_eq!(decoded.occurrences(), 0);
    }

    #[test]
    fn should_decode_listening_index_key() {
        // given
        let key = ListeningIndexKey {
            listening_key: "example.com".to_string(),
            connection_id: "c1".to_string(),
        };

        // when
        let encoded = key.encode();

        // then
        assert!(ListeningIndexKey::listening_range("example.com").contains(&encoded));
        assert_eq!(ListeningIndexKey::decode(&encoded).unwrap(), key);
    }
}
