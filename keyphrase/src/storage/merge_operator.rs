use bytes::Bytes;
use common::MergeOperator;

use crate::serde::TotalValue;

/// Merge operator that adds signed deltas to total rows.
///
/// Totals never go negative: a sum below zero is clamped to zero and
/// logged. The clamp makes merges order-dependent when a decrement arrives
/// before the increment it undoes (from 2, `-5` then `+5` ends at 5 rather
/// than 2). On the change feed this only happens when a failed increment is
/// redelivered after a later decrement succeeded; externally delivered
/// batches may arrive in any order. Undecodable stored values count as zero; an undecodable operand
/// leaves the stored value unchanged.
pub(crate) struct TotalMergeOperator;

impl MergeOperator for TotalMergeOperator {
    fn merge(&self, key: &Bytes, existing_value: Option<Bytes>, new_value: Bytes) -> Bytes {
        let delta = match TotalValue::decode(&new_value) {
            Ok(value) => value.count,
            Err(e) => {
                tracing::error!(error = %e, "dropping undecodable total delta");
                return existing_value.unwrap_or_else(|| TotalValue { count: 0 }.encode());
            }
        };

        let existing = match existing_value.as_deref().map(TotalValue::decode) {
            None => 0,
            Some(Ok(value)) => value.count,
            Some(Err(e)) => {
                tracing::error!(error = %e, "resetting undecodable total to zero");
                0
            }
        };

        let mut count = existing.saturating_add(delta);
        if count < 0 {
            tracing::warn!(
                key = ?key,
                existing,
                delta,
                "total would go negative, clamping to zero"
            );
            count = 0;
        }
        TotalValue { count }.encode()
    }
}
