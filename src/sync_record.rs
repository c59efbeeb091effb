/// The engine's published view of its own `sync_record`: bounding it to
/// `MAX_SHARED_SYNCED_INTERVALS_COUNT` and encoding it for peers, either as
/// a length-prefixed binary term list or a JSON array of `[end, start]`
/// pairs in descending order (§6).
use serde::{Deserialize, Serialize};

use crate::constants::MAX_SHARED_SYNCED_INTERVALS_COUNT;
use crate::interval_set::IntervalSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecordPair(pub u64, pub u64); // (end, start)

/// Bounded snapshot of a sync record, descending by end offset — the most
/// recently synced bytes are the ones peers most want to learn about.
pub fn bounded_snapshot(record: &IntervalSet) -> Vec<SyncRecordPair> {
    let mut pairs: Vec<SyncRecordPair> = record
        .iter()
        .map(|iv| SyncRecordPair(iv.end, iv.start))
        .collect();
    pairs.sort_by(|a, b| b.0.cmp(&a.0));
    pairs.truncate(MAX_SHARED_SYNCED_INTERVALS_COUNT);
    pairs
}

pub fn to_json(record: &IntervalSet) -> Result<String, serde_json::Error> {
    serde_json::to_string(&bounded_snapshot(record))
}

pub fn from_json(json: &str) -> Result<IntervalSet, serde_json::Error> {
    let pairs: Vec<SyncRecordPair> = serde_json::from_str(json)?;
    Ok(pairs_to_interval_set(&pairs))
}

/// Length-prefixed binary term list: `u32 count` followed by `count`
/// `(u64 end, u64 start)` pairs, big-endian.
pub fn to_binary_terms(record: &IntervalSet) -> Vec<u8> {
    let pairs = bounded_snapshot(record);
    let mut out = Vec::with_capacity(4 + pairs.len() * 16);
    out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    for SyncRecordPair(end, start) in pairs {
        out.extend_from_slice(&end.to_be_bytes());
        out.extend_from_slice(&start.to_be_bytes());
    }
    out
}

pub fn from_binary_terms(bytes: &[u8]) -> Option<IntervalSet> {
    let count = u32::from_be_bytes(bytes.get(0..4)?.try_into().ok()?) as usize;
    let mut pairs = Vec::with_capacity(count);
    let mut cursor = 4usize;
    for _ in 0..count {
        let end = u64::from_be_bytes(bytes.get(cursor..cursor + 8)?.try_into().ok()?);
        cursor += 8;
        let start = u64::from_be_bytes(bytes.get(cursor..cursor + 8)?.try_into().ok()?);
        cursor += 8;
        pairs.push(SyncRecordPair(end, start));
    }
    Some(pairs_to_interval_set(&pairs))
}

fn pairs_to_interval_set(pairs: &[SyncRecordPair]) -> IntervalSet {
    let mut set = IntervalSet::new();
    for SyncRecordPair(end, start) in pairs {
        set.add(*start, *end);
    }
    set
}
