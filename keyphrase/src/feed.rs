//! Decodes storage change-feed entries into change records.

use bytes::Bytes;
use common::{ChangeKind, StorageChange};

use crate::change::{
    ChangeRecord, ConnectionChangeRecord, ConnectionImage, EventKind, RawImage, join_sort_key,
};
use crate::error::Result;
use crate::model::TOTAL_MARKER;
use crate::serde::{
    ConnectionKey, ConnectionValue, OccurrenceKey, OccurrenceValue, RecordType, TotalKey,
    TotalValue,
};

/// A change the pipeline consumers care about.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecord {
    /// Occurrence or total row change.
    Occurrence(ChangeRecord),
    /// Connection registry change.
    Connection(ConnectionChangeRecord),
}

impl From<ChangeKind> for EventKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => EventKind::Insert,
            ChangeKind::Modify => EventKind::Modify,
            ChangeKind::Remove => EventKind::Remove,
        }
    }
}

/// Converts one storage change. Returns `None` for rows no consumer reads.
pub fn decode_change(change: &StorageChange) -> Result<Option<FeedRecord>> {
    let event_kind = EventKind::from(change.kind());
    let sequence_token = change.sequence.to_string();

    let record = match RecordType::of_key(&change.key)? {
        RecordType::Occurrence => {
            let key = OccurrenceKey::decode(&change.key)?;
            let image = |value: &Option<Bytes>| -> Result<Option<RawImage>> {
                value
                    .as_deref()
                    .map(|v| {
                        OccurrenceValue::decode(v)
                            .map(|value| RawImage::new(value.occurrences, value.aggregated))
                    })
                    .transpose()
            };
            FeedRecord::Occurrence(ChangeRecord {
                event_kind,
                partition_key: Some(key.site_key),
                sort_key: Some(join_sort_key(&key.pathname, &key.keyphrase)),
                sequence_token,
                new_image: image(&change.current)?,
                previous_image: image(&change.previous)?,
            })
        }
        RecordType::Total => {
            let key = TotalKey::decode(&change.key)?;
            let image = |value: &Option<Bytes>| -> Result<Option<RawImage>> {
                value
                    .as_deref()
                    .map(|v| TotalValue::decode(v).map(|value| RawImage::new(value.occurrences(), None)))
                    .transpose()
            };
            FeedRecord::Occurrence(ChangeRecord {
                event_kind,
                partition_key: Some(key.scope.partition_key().to_string()),
                sort_key: Some(join_sort_key(TOTAL_MARKER, &key.keyphrase)),
                sequence_token,
                new_image: image(&change.current)?,
                previous_image: image(&change.previous)?,
            })
        }
        RecordType::Connection => {
            let key = ConnectionKey::decode(&change.key)?;
            let new_image = match change.current.as_deref() {
                Some(value) => Some(ConnectionImage::from(
                    &ConnectionValue::decode(value)?.into_connection(key.connection_id),
                )),
                None => None,
            };
            FeedRecord::Connection(ConnectionChangeRecord {
                event_kind,
                sequence_token,
                new_image,
            })
        }
        RecordType::ListeningIndex => return Ok(None),
    };
    Ok(Some(record))
}
