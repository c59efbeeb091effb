/// Sync scheduler (§4.4): the state machine that decides what to fetch
/// next and from which peer, driven by timers and by the engine's own
/// sync record. Everything here runs inside the engine actor because it
/// reads and mutates `sync_record`/`peer_sync_records`/cursors directly;
/// only the peer I/O itself (`PeerClient` calls) is offloaded to a spawned
/// task that reports back through `EngineHandle`.
use rand::Rng;

use crate::constants::{
    MAX_SHARED_SYNCED_INTERVALS_COUNT, MIN_CHUNK_ATTRACTIVENESS_RATIO, MISSING_PROBE_STEP,
};
use crate::interval_set::Interval;
use crate::keys::offset_key;
use crate::kv::Kv;
use crate::model::{decode, encode, ChunkIndexEntry, DataRootOffsetEntry};
use crate::peer_client::{Peer, PeerChunk};
use crate::types::{AbsoluteOffset, Result};

use super::state::EngineState;
use super::store_chunk::{store_chunk, StoreChunkParams, StoreOutcome};
use super::EngineHandle;

/// `check_space_sync_random_interval`: the `DISK_SPACE_CHECK_FREQUENCY_MS`
/// timer's handler.
pub fn check_space_sync_random_interval(state: &EngineState, handle: &EngineHandle) {
    let free = crate::disk_space::free_bytes(&state.config.db_path());
    if free <= state.config.disk_data_buffer_size() {
        tracing::warn!(free, "disk space below buffer, sync idle");
        return;
    }
    handle.sync_random_interval(Vec::new());
}

/// `sync_random_interval(excluded)`.
pub fn sync_random_interval(state: &mut EngineState, handle: &EngineHandle, excluded: &[Peer]) {
    let mut best: Option<(Peer, Interval)> = None;
    let mut best_sum = 0u64;

    for (peer, record) in &state.peer_sync_records {
        if excluded.contains(peer) {
            continue;
        }
        let mut capped = record.clone();
        capped.cut(state.weave_size);
        let wanted = state.sync_record.outer_join(&capped);
        let sum = wanted.sum();
        if sum == 0 {
            continue;
        }
        if let Some(iv) = pick_random_interval(&wanted, sum) {
            if sum > best_sum {
                best_sum = sum;
                best = Some((peer.clone(), iv));
            }
        }
    }

    if let Some((peer, interval)) = best {
        let sync_size = (state.weave_size / MAX_SHARED_SYNCED_INTERVALS_COUNT as u64).max(1);
        let mut rng = rand::thread_rng();
        let byte = rng.gen_range(interval.start..interval.end);
        let left = interval.start.max(byte.saturating_sub(sync_size / 2));
        let right = interval.end.min(left + sync_size);
        handle.sync_chunk(peer, left, byte, byte, right);
        return;
    }

    advance_missing_cursor(state, handle);
}

fn pick_random_interval(set: &crate::interval_set::IntervalSet, sum: u64) -> Option<Interval> {
    if sum == 0 {
        return None;
    }
    let mut rng = rand::thread_rng();
    let target = rng.gen_range(0..sum);
    let mut acc = 0u64;
    for iv in set.iter() {
        acc += iv.len();
        if acc > target {
            return Some(iv);
        }
    }
    set.iter().last()
}

fn advance_missing_cursor(state: &mut EngineState, handle: &EngineHandle) {
    let Ok(Some((end_key, start_value, next))) = state.tables.missing_chunks_index.iter_from(&state.missing_data_cursor) else {
        return;
    };
    let Some(end) = crate::keys::decode_offset_key(&end_key) else { return };
    let Some(start) = crate::keys::decode_offset_key(&start_value) else { return };

    let probe = if state.missing_data_cursor.is_empty() {
        let step = MISSING_PROBE_STEP.max(1).min((end - start).max(1));
        let mut rng = rand::thread_rng();
        start + rng.gen_range(1..=step.max(1))
    } else {
        start + 1
    };
    let probe = probe.min(end.saturating_sub(1)).max(start);

    if let Ok(Some((chunk_key, value))) = state.tables.chunks_index.get_next(&offset_key(probe)) {
        if let Some(chunk_end) = crate::keys::decode_offset_key(&chunk_key) {
            let entry: Result<ChunkIndexEntry> = decode(&value);
            if let Ok(entry) = entry {
                let chunk_start = chunk_end - entry.chunk_size;
                if chunk_start <= probe && probe < chunk_end {
                    // the probed byte is already covered: the missing
                    // interval was a false positive. Delete it and
                    // re-insert the complement pieces (outer_join of the
                    // missing interval and the covering chunk's range) as
                    // a single batch (§4.4 step 3, §9), then try again.
                    if let Err(e) = resolve_missing_interval(state, start, end, chunk_start, chunk_end) {
                        tracing::error!(error = %e, "failed to resolve missing interval");
                        return;
                    }
                    state.missing_data_cursor = next;
                    handle.sync_random_interval(Vec::new());
                    return;
                }
            }
        }
    }

    state.missing_data_cursor = next;

    if let Some(peer) = state
        .peer_sync_records
        .iter()
        .find(|(_, record)| record.is_inside(probe))
        .map(|(p, _)| p.clone())
    {
        handle.sync_chunk(peer, probe.saturating_sub(1), probe.saturating_sub(1), probe, probe);
    }
}

/// Deletes the `[missing_start, missing_end)` row from `missing_chunks_index`
/// (and the mirrored in-memory `missing_chunks` set), then re-inserts
/// whichever pieces of it the covering chunk `[chunk_start, chunk_end)`
/// doesn't actually cover. The resolved overlap is refunded from
/// `compacted_size` (invariant 3).
fn resolve_missing_interval(
    state: &mut EngineState,
    missing_start: AbsoluteOffset,
    missing_end: AbsoluteOffset,
    chunk_start: AbsoluteOffset,
    chunk_end: AbsoluteOffset,
) -> Result<()> {
    let mut missing_set = crate::interval_set::IntervalSet::new();
    missing_set.add(missing_start, missing_end);
    let mut chunk_set = crate::interval_set::IntervalSet::new();
    chunk_set.add(chunk_start, chunk_end);
    let complements = missing_set.outer_join(&chunk_set);

    let overlap_start = missing_start.max(chunk_start);
    let overlap_end = missing_end.min(chunk_end);

    let mut batch = crate::batch::AtomicBatch::new(state.db.clone());
    batch.delete("missing_chunks_index", offset_key(missing_end));
    state.missing_chunks.delete(missing_start, missing_end);

    for piece in complements.iter() {
        batch.put(
            "missing_chunks_index",
            offset_key(piece.end),
            offset_key(piece.start),
        );
        state.missing_chunks.add(piece.start, piece.end);
    }
    batch.commit()?;

    if overlap_end > overlap_start {
        state.compacted_size = state.compacted_size.saturating_sub(overlap_end - overlap_start);
    }
    Ok(())
}

/// `sync_chunk(peer, left_bound, l_byte, r_byte, right_bound)`.
pub fn sync_chunk(
    state: &EngineState,
    handle: &EngineHandle,
    peer: Peer,
    left_bound: u64,
    l_byte: u64,
    r_byte: u64,
    right_bound: u64,
) {
    if r_byte >= right_bound && l_byte < left_bound {
        handle.check_space_sync_random_interval();
        return;
    }

    let probe = if r_byte < right_bound { r_byte } else { l_byte };
    if state.blacklist.is_byte_blacklisted(probe) {
        let (next_l, next_r) = if r_byte < right_bound {
            (l_byte, r_byte + 1)
        } else {
            (l_byte.saturating_sub(1), r_byte)
        };
        handle.sync_chunk(peer, left_bound, next_l, next_r, right_bound);
        return;
    }

    let peer_client = state.peer_client.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        match peer_client.fetch_chunk(&peer, probe).await {
            Ok(chunk) => handle.store_fetched_chunk(peer, probe, chunk, (left_bound, l_byte, r_byte, right_bound)),
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "chunk fetch failed");
                handle.sync_random_interval(vec![peer]);
            }
        }
    });
}

/// `store_fetched_chunk`.
pub fn store_fetched_chunk(
    state: &mut EngineState,
    handle: &EngineHandle,
    peer: Peer,
    probe_byte: AbsoluteOffset,
    chunk: PeerChunk,
    window: (u64, u64, u64, u64),
) -> Result<()> {
    let attractiveness = chunk.chunk.len() as f64 / (1.0 + chunk.data_path.len() as f64);
    if attractiveness < MIN_CHUNK_ATTRACTIVENESS_RATIO {
        handle.sync_random_interval(vec![peer]);
        return Ok(());
    }

    let Some((block_start_key, raw)) = state.tables.data_root_offset_index.get_prev(&offset_key(probe_byte))? else {
        handle.sync_random_interval(vec![peer]);
        return Ok(());
    };
    let Some(block_start) = crate::keys::decode_offset_key(&block_start_key) else {
        handle.sync_random_interval(vec![peer]);
        return Ok(());
    };
    let mut block_entry: DataRootOffsetEntry = decode(&raw)?;

    let validated = crate::merkle::validate_chunk_proof(
        state.merkle.as_ref(),
        &chunk.data_root,
        &block_entry.tx_root,
        probe_byte - block_start,
        block_entry.block_size,
        &chunk.data_path,
        chunk.tx_path.as_deref().unwrap_or(&[]),
        &chunk.chunk,
        crate::constants::MAX_CHUNK_BYTES,
    );
    let Some(validated) = validated else {
        handle.sync_random_interval(vec![peer]);
        return Ok(());
    };

    let data_path_hash = sha256(&chunk.data_path);
    let data_root_key_bytes = crate::keys::data_root_key(&chunk.data_root, block_entry.block_size);

    let mut dre = match state.tables.data_root_index.get(&data_root_key_bytes)? {
        Some(raw) => decode(&raw)?,
        None => crate::model::DataRootEntry::default(),
    };
    dre.insert_placement(block_entry.tx_root, block_start, chunk.tx_path.clone().unwrap_or_default());
    block_entry.data_root_keys.insert(data_root_key_bytes.clone());

    let mut batch = crate::batch::AtomicBatch::new(state.db.clone());
    batch.put("data_root_index", data_root_key_bytes.clone(), encode(&dre)?);
    batch.put("data_root_offset_index", block_start_key, encode(&block_entry)?);
    batch.commit()?;

    let chunk_len = chunk.chunk.len() as u64;
    let abs_offset = block_start + validated.chunk_end_in_tx;
    let mut batch2 = crate::batch::AtomicBatch::new(state.db.clone());
    let outcome = store_chunk(
        state,
        &mut batch2,
        StoreChunkParams {
            abs_offset,
            chunk_offset_in_tx: validated.chunk_end_in_tx,
            data_path_hash,
            tx_root: block_entry.tx_root,
            data_root: chunk.data_root,
            tx_path: chunk.tx_path.unwrap_or_default(),
            chunk_size: chunk_len,
            chunk_bytes: Some(chunk.chunk),
            data_path_bytes: chunk.data_path,
            data_root_key: data_root_key_bytes,
            index_only: false,
            source: "sync",
        },
    )?;
    batch2.commit()?;
    crate::metrics::BYTES_SYNCED.inc_by(chunk_len);
    if let StoreOutcome::Stored { should_compact: true } = outcome {
        handle.compact_intervals();
    }

    let (left_bound, l_byte, r_byte, right_bound) = window;
    let (next_l, next_r) = if probe_byte == r_byte {
        (l_byte, r_byte + 1)
    } else {
        (l_byte.saturating_sub(1), r_byte)
    };
    handle.sync_chunk(peer, left_bound, next_l, next_r, right_bound);
    Ok(())
}

fn sha256(bytes: &[u8]) -> crate::types::Hash32 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;
    use crate::keys::hash_key;
    use crate::kv::Kv;
    use crate::merkle::{Leaf, MerkleVerify, Sha256MerkleTree};
    use crate::model::{decode, ChunkDataEntry, ChunkIndexEntry, DataRootOffsetEntry};
    use std::collections::BTreeSet;

    fn leaf_of(bytes: &[u8], cumulative: u64) -> Leaf {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash: crate::types::Hash32 = hasher.finalize().into();
        Leaf { hash, max_byte_range: cumulative }
    }

    /// Fetching a single chunk through `store_fetched_chunk` must land it
    /// at its absolute end offset in `chunks_index` (scenario S5: every
    /// synced chunk is retrievable via `get_chunk(abs_end)`).
    #[test]
    fn store_fetched_chunk_indexes_at_the_chunk_absolute_end_offset() {
        let (mut state, db) = test_state();
        let merkle = Sha256MerkleTree;

        // large enough that chunk_size / (1 + data_path.len()) clears
        // MIN_CHUNK_ATTRACTIVENESS_RATIO (a 41-byte single-leaf data path).
        let chunk_bytes = vec![7u8; 64 * 1024];
        let data_leaf = leaf_of(&chunk_bytes, chunk_bytes.len() as u64);
        let (data_root, data_blob) = merkle.generate_tree(&[data_leaf]);
        let data_path = merkle.generate_path(&data_root, 0, &data_blob).unwrap();

        let tx_leaf = Leaf { hash: data_root, max_byte_range: chunk_bytes.len() as u64 };
        let (tx_root, tx_blob) = merkle.generate_tree(&[tx_leaf]);
        let tx_path = merkle.generate_path(&tx_root, 0, &tx_blob).unwrap();

        let block_start: u64 = 1_000;
        let block_size = chunk_bytes.len() as u64;
        state
            .tables
            .data_root_offset_index
            .put(
                &offset_key(block_start),
                &crate::model::encode(&DataRootOffsetEntry {
                    tx_root,
                    block_size,
                    data_root_keys: BTreeSet::new(),
                })
                .unwrap(),
            )
            .unwrap();

        let probe_byte = block_start + 1; // any byte inside the chunk's window
        let chunk = PeerChunk {
            chunk: chunk_bytes.clone(),
            data_path,
            data_root,
            tx_path: Some(tx_path),
            offset: probe_byte,
        };

        let handle = crate::engine::EngineHandle::test_handle();
        let window = (block_start, probe_byte, probe_byte, block_start + block_size);
        store_fetched_chunk(&mut state, &handle, "peer-a".to_string(), probe_byte, chunk, window).unwrap();

        let expected_abs_end = block_start + chunk_bytes.len() as u64;
        let raw = state
            .tables
            .chunks_index
            .get(&offset_key(expected_abs_end))
            .unwrap()
            .expect("chunk indexed at its absolute end offset");
        let entry: ChunkIndexEntry = decode(&raw).unwrap();
        assert_eq!(entry.chunk_size, chunk_bytes.len() as u64);
        assert_eq!(entry.tx_root, tx_root);

        // the arbitrary probe byte itself must NOT have become a key.
        assert!(state
            .tables
            .chunks_index
            .get(&offset_key(probe_byte))
            .unwrap()
            .is_none());

        let data_raw = state
            .tables
            .chunk_data_index
            .get(&hash_key(&entry.data_path_hash))
            .unwrap()
            .expect("chunk bytes stored under their data-path hash");
        let data_entry: ChunkDataEntry = decode(&data_raw).unwrap();
        assert_eq!(data_entry.chunk_bytes, chunk_bytes);

        assert!(state.sync_record.is_inside(expected_abs_end - 1));
        let _ = db;
    }
}
