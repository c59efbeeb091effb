/// Compaction (§4.7): bounding the sync record's serialized size by merging
/// its closest neighbours, tracking what got swallowed so a later scan can
/// still go looking for it.
use crate::batch::AtomicBatch;
use crate::constants::MAX_SHARED_SYNCED_INTERVALS_COUNT;
use crate::keys::offset_key;

use super::state::EngineState;
use crate::types::Result;

pub fn compact_intervals(state: &mut EngineState) -> Result<()> {
    let swallowed = state.sync_record.compact(MAX_SHARED_SYNCED_INTERVALS_COUNT);
    if swallowed.is_empty() {
        return Ok(());
    }

    let mut batch = AtomicBatch::new(state.db.clone());
    let mut largest: Option<crate::interval_set::Interval> = None;
    for interval in &swallowed {
        state.missing_chunks.add(interval.start, interval.end);
        state.compacted_size += interval.len();
        batch.put(
            "missing_chunks_index",
            offset_key(interval.end),
            offset_key(interval.start),
        );
        if largest.map(|l| interval.len() > l.len()).unwrap_or(true) {
            largest = Some(*interval);
        }
    }
    batch.commit()?;

    if let Some(biggest) = largest {
        state.missing_data_cursor = offset_key(biggest.start + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;

    #[test]
    fn compaction_records_swallowed_spans_and_picks_the_biggest_hole() {
        let (mut state, _db) = test_state();
        for i in 0..(MAX_SHARED_SYNCED_INTERVALS_COUNT as u64 + 50) {
            state.sync_record.add(i * 1000, i * 1000 + 1);
        }
        let before_sum = state.sync_record.sum();
        compact_intervals(&mut state).unwrap();

        assert!(state.sync_record.count() <= MAX_SHARED_SYNCED_INTERVALS_COUNT);
        assert!(state.compacted_size > 0);
        assert_eq!(state.sync_record.sum() + state.missing_chunks.sum(), before_sum);
        assert!(!state.missing_data_cursor.is_empty());
    }

    #[test]
    fn no_op_when_already_within_bounds() {
        let (mut state, _db) = test_state();
        state.sync_record.add(0, 10);
        compact_intervals(&mut state).unwrap();
        assert_eq!(state.compacted_size, 0);
        assert!(state.missing_data_cursor.is_empty());
    }
}
