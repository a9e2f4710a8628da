//! Classifiers that validate raw change records and normalize them into
//! the units the engines work on.
//!
//! A rejected record is reported as [`Error::InvalidInput`]; callers log it
//! and skip it without affecting sibling records.

use crate::change::{ChangeRecord, EventKind, Image, split_sort_key};
use crate::error::{Error, Result};
use crate::model::{BaseUrlOccurrenceUpdate, TOTAL_MARKER, TotalScope};

/// A page-level keyphrase count changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceItem {
    pub site_key: String,
    pub pathname: String,
    pub keyphrase: String,
    pub current: Image,
    pub previous: Option<Image>,
}

impl OccurrenceItem {
    /// Net change this item contributes to its totals. Without a previous
    /// image (an insert) this is the new value itself. Counts outside the
    /// `i64` range are rejected.
    pub fn delta(&self) -> Result<i64> {
        let previous = self.previous.map(|p| p.occurrences).unwrap_or(0);
        let out_of_range =
            |n: u64| Error::InvalidInput(format!("occurrences out of range: {}", n));
        let current = i64::try_from(self.current.occurrences)
            .map_err(|_| out_of_range(self.current.occurrences))?;
        let previous = i64::try_from(previous).map_err(|_| out_of_range(previous))?;
        current
            .checked_sub(previous)
            .ok_or_else(|| Error::InvalidInput("occurrence delta overflows".into()))
    }
}

/// A total row itself changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalItem {
    pub scope: TotalScope,
    pub keyphrase: String,
    pub current: Image,
    pub previous: Option<Image>,
}

/// Input unit of the total aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationItem {
    Occurrence(OccurrenceItem),
    Total(TotalItem),
}

/// Classifies a store mutation for total aggregation.
///
/// Partition key `TOTAL` marks a global total; a sort key whose first
/// segment is `TOTAL` marks a site total; anything else is a page-level
/// occurrence keyed `<pathname>#<keyphrase>`.
pub fn classify_aggregation(record: &ChangeRecord) -> Result<AggregationItem> {
    let is_modify = match record.event_kind {
        EventKind::Insert => false,
        EventKind::Modify => true,
        other => {
            return Err(Error::InvalidInput(format!(
                "unsupported event kind for aggregation: {:?}",
                other
            )));
        }
    };

    let (partition_key, sort_key) = record.keys()?;
    let (head, keyphrase) = split_sort_key(sort_key).ok_or_else(|| {
        Error::InvalidInput(format!("sort key without separator: {}", sort_key))
    })?;
    if keyphrase.is_empty() {
        return Err(Error::InvalidInput(format!(
            "sort key without keyphrase: {}",
            sort_key
        )));
    }

    let current = record
        .new_image
        .as_ref()
        .ok_or_else(|| Error::InvalidInput("record missing new image".into()))
        .and_then(Image::parse)?;
    let previous = if is_modify {
        let raw = record
            .previous_image
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("MODIFY record missing previous image".into()))?;
        Some(Image::parse(raw)?)
    } else {
        None
    };

    if partition_key == TOTAL_MARKER {
        return Ok(AggregationItem::Total(TotalItem {
            scope: TotalScope::Global,
            keyphrase: keyphrase.to_string(),
            current,
            previous,
        }));
    }
    if head == TOTAL_MARKER {
        return Ok(AggregationItem::Total(TotalItem {
            scope: TotalScope::Site(partition_key.to_string()),
            keyphrase: keyphrase.to_string(),
            current,
            previous,
        }));
    }
    Ok(AggregationItem::Occurrence(OccurrenceItem {
        site_key: partition_key.to_string(),
        pathname: head.to_string(),
        keyphrase: keyphrase.to_string(),
        current,
        previous,
    }))
}

/// Normalizes a store mutation into the update pushed to listeners.
///
/// Removals carry no image, so they are reported as zero occurrences derived
/// from the key alone. Total rows get an empty pathname.
pub fn classify_connection_update(record: &ChangeRecord) -> Result<BaseUrlOccurrenceUpdate> {
    if record.event_kind == EventKind::Unknown {
        return Err(Error::InvalidInput("unrecognized event kind".into()));
    }

    let (partition_key, sort_key) = record.keys()?;
    let (head, keyphrase) = split_sort_key(sort_key).ok_or_else(|| {
        Error::InvalidInput(format!("sort key without separator: {}", sort_key))
    })?;

    let occurrences = match record.event_kind {
        EventKind::Remove => 0,
        _ => {
            record
                .new_image
                .as_ref()
                .ok_or_else(|| Error::InvalidInput("record missing new image".into()))
                .and_then(Image::parse)?
                .occurrences
        }
    };

    let pathname = if head == TOTAL_MARKER { "" } else { head };
    Ok(BaseUrlOccurrenceUpdate {
        listening_key: partition_key.to_string(),
        pathname: pathname.to_string(),
        keyphrase: keyphrase.to_string(),
        occurrences,
    })
}
