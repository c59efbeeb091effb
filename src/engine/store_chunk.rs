/// Store-chunk primitive (§4.3): the one path through which a chunk's bytes
/// and every index row about it land in the KV, atomically.
use crate::batch::AtomicBatch;
use crate::constants::{
    EXTRA_INTERVALS_BEFORE_COMPACTION, MAX_SHARED_SYNCED_INTERVALS_COUNT,
};
use crate::keys::{disk_pool_key, hash_key, offset_key};
use crate::kv::Kv;
use crate::model::{encode, ChunkDataEntry, ChunkIndexEntry, DiskPoolChunkEntry};
use crate::types::{AbsoluteOffset, Hash32, Result};

use super::state::EngineState;

pub struct StoreChunkParams {
    pub abs_offset: AbsoluteOffset,
    pub chunk_offset_in_tx: u64,
    pub data_path_hash: Hash32,
    pub tx_root: Hash32,
    pub data_root: Hash32,
    pub tx_path: Vec<u8>,
    pub chunk_size: u64,
    pub chunk_bytes: Option<Vec<u8>>,
    pub data_path_bytes: Vec<u8>,
    pub data_root_key: Vec<u8>,
    pub index_only: bool,
    /// Label for `weavesync_chunks_stored_total` ("add_chunk", "sync", or
    /// "disk_pool_promotion"); purely observational.
    pub source: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { should_compact: bool },
    NotUpdated,
}

pub fn store_chunk(
    state: &mut EngineState,
    batch: &mut AtomicBatch,
    params: StoreChunkParams,
) -> Result<StoreOutcome> {
    let timer = crate::metrics::Timer::new();
    let outcome = store_chunk_inner(state, batch, params);
    timer.observe(&crate::metrics::CHUNK_STORE_DURATION);
    outcome
}

fn store_chunk_inner(
    state: &mut EngineState,
    batch: &mut AtomicBatch,
    params: StoreChunkParams,
) -> Result<StoreOutcome> {
    let offset_bytes = offset_key(params.abs_offset);

    let already_indexed = state.tables.chunks_index.get(&offset_bytes)?.is_some();
    if state.sync_record.is_inside(params.abs_offset) && already_indexed {
        return Ok(StoreOutcome::NotUpdated);
    }
    if state.blacklist.is_byte_blacklisted(params.abs_offset) {
        return Ok(StoreOutcome::NotUpdated);
    }

    if !params.index_only {
        if let Some(chunk_bytes) = &params.chunk_bytes {
            let data_entry = ChunkDataEntry {
                chunk_bytes: chunk_bytes.clone(),
                data_path_bytes: params.data_path_bytes.clone(),
            };
            batch.put(
                "chunk_data_index",
                hash_key(&params.data_path_hash),
                encode(&data_entry)?,
            );
        }
    }

    let index_entry = ChunkIndexEntry {
        data_path_hash: params.data_path_hash,
        tx_root: params.tx_root,
        data_root: params.data_root,
        tx_path: params.tx_path,
        chunk_offset_in_tx: params.chunk_offset_in_tx,
        chunk_size: params.chunk_size,
    };
    batch.put("chunks_index", offset_bytes, encode(&index_entry)?);

    if let Some(root_entry) = state.disk_pool.data_roots.get(&params.data_root_key) {
        let tx_size = crate::keys::decode_data_root_key(&params.data_root_key)
            .map(|(_, size)| size)
            .unwrap_or(0);
        let dp_entry = DiskPoolChunkEntry {
            chunk_offset_in_tx: params.chunk_offset_in_tx,
            chunk_size: params.chunk_size,
            data_root: params.data_root,
            tx_size,
        };
        batch.put(
            "disk_pool_chunks_index",
            disk_pool_key(root_entry.first_seen_ts_us, &params.data_path_hash),
            encode(&dp_entry)?,
        );
    }

    let start = params.abs_offset - params.chunk_size;
    let was_covered = state.sync_record.is_inside(start);
    state.sync_record.add(start, params.abs_offset);

    if !was_covered {
        reclaim_compacted_span(state, start, params.abs_offset);
    }

    let should_compact = state.sync_record.count()
        > MAX_SHARED_SYNCED_INTERVALS_COUNT + EXTRA_INTERVALS_BEFORE_COMPACTION;

    crate::metrics::CHUNKS_STORED.with_label_values(&[params.source]).inc();
    crate::metrics::SYNC_RECORD_INTERVAL_COUNT.set(state.sync_record.count() as i64);
    crate::metrics::SYNC_RECORD_BYTES.set(state.sync_record.sum() as i64);

    Ok(StoreOutcome::Stored { should_compact })
}

/// If `[start, end)` fills in ground previously swallowed by compaction,
/// shrink (or drop) the `missing_chunks_index` entry covering it and give
/// back the reclaimed span to `compacted_size` (invariant 3).
fn reclaim_compacted_span(state: &mut EngineState, start: AbsoluteOffset, end: AbsoluteOffset) {
    let Some(missing) = state.missing_chunks.containing(start).or_else(|| state.missing_chunks.containing(end.saturating_sub(1))) else {
        return;
    };
    let overlap_start = missing.start.max(start);
    let overlap_end = missing.end.min(end);
    if overlap_end <= overlap_start {
        return;
    }
    state.missing_chunks.delete(overlap_start, overlap_end);
    state.compacted_size = state.compacted_size.saturating_sub(overlap_end - overlap_start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;

    #[test]
    fn first_store_of_a_chunk_extends_the_sync_record() {
        let (mut state, db) = test_state();
        let mut batch = AtomicBatch::new(db);
        let outcome = store_chunk(
            &mut state,
            &mut batch,
            StoreChunkParams {
                abs_offset: 100,
                chunk_offset_in_tx: 0,
                data_path_hash: [1u8; 32],
                tx_root: [2u8; 32],
                data_root: [3u8; 32],
                tx_path: vec![9],
                chunk_size: 100,
                chunk_bytes: Some(vec![0u8; 100]),
                data_path_bytes: vec![1, 2, 3],
                data_root_key: vec![0u8; 40],
                index_only: false,
                source: "test",
            },
        )
        .unwrap();
        batch.commit().unwrap();
        assert_eq!(outcome, StoreOutcome::Stored { should_compact: false });
        assert!(state.sync_record.is_inside(50));
    }

    #[test]
    fn repeated_store_of_an_already_synced_offset_is_not_updated() {
        let (mut state, db) = test_state();
        let params = |bytes: Option<Vec<u8>>| StoreChunkParams {
            abs_offset: 100,
            chunk_offset_in_tx: 0,
            data_path_hash: [1u8; 32],
            tx_root: [2u8; 32],
            data_root: [3u8; 32],
            tx_path: vec![9],
            chunk_size: 100,
            chunk_bytes: bytes,
            data_path_bytes: vec![1, 2, 3],
            data_root_key: vec![0u8; 40],
            index_only: false,
            source: "test",
        };
        let mut batch = AtomicBatch::new(db.clone());
        store_chunk(&mut state, &mut batch, params(Some(vec![0u8; 100]))).unwrap();
        batch.commit().unwrap();

        let mut batch2 = AtomicBatch::new(db);
        let outcome = store_chunk(&mut state, &mut batch2, params(Some(vec![0u8; 100]))).unwrap();
        assert_eq!(outcome, StoreOutcome::NotUpdated);
    }

    #[test]
    fn blacklisted_offset_is_never_stored() {
        let (mut state, db, blacklist) = crate::engine::state::test_support::test_state_with_blacklist();
        blacklist.lock().unwrap().blacklist_offset(100);
        let mut batch = AtomicBatch::new(db);
        let outcome = store_chunk(
            &mut state,
            &mut batch,
            StoreChunkParams {
                abs_offset: 100,
                chunk_offset_in_tx: 0,
                data_path_hash: [1u8; 32],
                tx_root: [2u8; 32],
                data_root: [3u8; 32],
                tx_path: vec![],
                chunk_size: 100,
                chunk_bytes: Some(vec![0u8; 100]),
                data_path_bytes: vec![],
                data_root_key: vec![0u8; 40],
                index_only: false,
                source: "test",
            },
        )
        .unwrap();
        assert_eq!(outcome, StoreOutcome::NotUpdated);
        assert!(!state.sync_record.is_inside(50));
    }

    #[test]
    fn filling_a_compacted_gap_refunds_compacted_size() {
        let (mut state, db) = test_state();
        state.missing_chunks.add(40, 60);
        state.compacted_size = 20;

        let mut batch = AtomicBatch::new(db);
        store_chunk(
            &mut state,
            &mut batch,
            StoreChunkParams {
                abs_offset: 60,
                chunk_offset_in_tx: 0,
                data_path_hash: [5u8; 32],
                tx_root: [0u8; 32],
                data_root: [0u8; 32],
                tx_path: vec![],
                chunk_size: 20,
                chunk_bytes: Some(vec![0u8; 20]),
                data_path_bytes: vec![],
                data_root_key: vec![0u8; 40],
                index_only: false,
                source: "test",
            },
        )
        .unwrap();
        assert_eq!(state.compacted_size, 0);
        assert!(state.missing_chunks.is_empty());
    }
}
