/// Disk-pool processor (§4.5): a cyclic walk over `disk_pool_chunks_index`
/// that skips over roots still pending, drops roots that expired without
/// confirmation, and promotes confirmed roots' staged chunks into the main
/// indices. Ticks on `DISK_POOL_SCAN_FREQUENCY_MS` when there is nothing
/// left to do, immediately otherwise (the engine re-casts itself as long as
/// a step makes progress).
use crate::batch::AtomicBatch;
use crate::keys::{decode_disk_pool_key, disk_pool_key, hash_key};
use crate::kv::Kv;
use crate::model::{decode, DataRootEntry, DiskPoolChunkEntry};
use crate::types::Result;

use super::state::EngineState;
use super::store_chunk::{store_chunk, StoreChunkParams, StoreOutcome};
use super::EngineHandle;

/// Outcome of a single step, telling the caller whether to immediately
/// re-drive the walk or fall back to the idle timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    MadeProgress,
    Idle,
}

/// One step of the cyclic walk. Advances `state.disk_pool_cursor`.
pub fn step(state: &mut EngineState, handle: &EngineHandle) -> Result<StepOutcome> {
    let Some((key, value, next)) = state.tables.disk_pool_chunks_index.iter_from(&state.disk_pool_cursor)? else {
        return Ok(StepOutcome::Idle);
    };
    let Some((timestamp, data_path_hash)) = decode_disk_pool_key(&key) else {
        state.disk_pool_cursor = next;
        return Ok(StepOutcome::MadeProgress);
    };
    let entry: DiskPoolChunkEntry = decode(&value)?;
    let data_root_key = crate::keys::data_root_key(&entry.data_root, entry.tx_size);

    let known_root = state.tables.data_root_index.get(&data_root_key)?;
    let still_pending = state.disk_pool.contains(&data_root_key);

    match (known_root, still_pending) {
        (None, true) => {
            // root still pending confirmation: skip past every sibling
            // chunk staged under this same timestamp.
            state.disk_pool_cursor = disk_pool_key(timestamp + 1, &[0u8; 32]);
        }
        (None, false) => {
            // root expired without ever being confirmed: drop the staged
            // chunk bytes and the index row.
            let mut batch = AtomicBatch::new(state.db.clone());
            batch.delete("disk_pool_chunks_index", key);
            batch.delete("chunk_data_index", hash_key(&data_path_hash));
            batch.commit()?;
            state.disk_pool_cursor = next;
            crate::metrics::DISK_POOL_ROOTS_EXPIRED.inc();
        }
        (Some(raw), still_in_pool) => {
            let dre: DataRootEntry = decode(&raw)?;
            for (tx_root, starts) in &dre.placements {
                for (abs_tx_start, tx_path) in starts {
                    let abs_offset = abs_tx_start + entry.chunk_offset_in_tx;
                    let mut batch = AtomicBatch::new(state.db.clone());
                    let outcome = store_chunk(
                        state,
                        &mut batch,
                        StoreChunkParams {
                            abs_offset,
                            chunk_offset_in_tx: entry.chunk_offset_in_tx,
                            data_path_hash,
                            tx_root: *tx_root,
                            data_root: entry.data_root,
                            tx_path: tx_path.clone(),
                            chunk_size: entry.chunk_size,
                            chunk_bytes: None,
                            data_path_bytes: Vec::new(),
                            data_root_key: data_root_key.clone(),
                            index_only: true,
                            source: "disk_pool_promotion",
                        },
                    )?;
                    batch.commit()?;
                    if let StoreOutcome::Stored { should_compact: true } = outcome {
                        handle.compact_intervals();
                    }
                }
            }
            if !still_in_pool {
                let mut batch = AtomicBatch::new(state.db.clone());
                batch.delete("disk_pool_chunks_index", key);
                batch.commit()?;
                crate::metrics::DISK_POOL_ROOTS_PROMOTED.inc();
            }
            state.disk_pool_cursor = next;
        }
    }

    Ok(StepOutcome::MadeProgress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;
    use crate::keys::hash_key as hkey;
    use crate::model::{encode, ChunkDataEntry};

    fn stage(state: &mut EngineState, ts: u128, hash: [u8; 32], entry: &DiskPoolChunkEntry) {
        state
            .tables
            .disk_pool_chunks_index
            .put(&disk_pool_key(ts, &hash), &encode(entry).unwrap())
            .unwrap();
        state
            .tables
            .chunk_data_index
            .put(
                &hkey(&hash),
                &encode(&ChunkDataEntry {
                    chunk_bytes: vec![0u8; entry.chunk_size as usize],
                    data_path_bytes: vec![],
                })
                .unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn pending_root_is_skipped_forward() {
        let (mut state, _db) = test_state();
        let data_root = [1u8; 32];
        let key = crate::keys::data_root_key(&data_root, 100);
        state.disk_pool.mark_pending(key, [9u8; 32], 0);

        let chunk_hash = [2u8; 32];
        stage(
            &mut state,
            5,
            chunk_hash,
            &DiskPoolChunkEntry {
                chunk_offset_in_tx: 0,
                chunk_size: 100,
                data_root,
                tx_size: 100,
            },
        );

        let handle = super::EngineHandle::test_handle();
        let outcome = step(&mut state, &handle).unwrap();
        assert_eq!(outcome, StepOutcome::MadeProgress);
        // still staged: the root was pending, not expired.
        assert!(state
            .tables
            .disk_pool_chunks_index
            .get(&disk_pool_key(5, &chunk_hash))
            .unwrap()
            .is_some());
    }

    #[test]
    fn expired_unconfirmed_root_is_dropped() {
        let (mut state, _db) = test_state();
        let data_root = [3u8; 32];
        let chunk_hash = [4u8; 32];
        stage(
            &mut state,
            7,
            chunk_hash,
            &DiskPoolChunkEntry {
                chunk_offset_in_tx: 0,
                chunk_size: 50,
                data_root,
                tx_size: 100,
            },
        );
        // not in disk_pool.data_roots and not in data_root_index: expired.
        let handle = super::EngineHandle::test_handle();
        let outcome = step(&mut state, &handle).unwrap();
        assert_eq!(outcome, StepOutcome::MadeProgress);
        assert!(state
            .tables
            .disk_pool_chunks_index
            .get(&disk_pool_key(7, &chunk_hash))
            .unwrap()
            .is_none());
        assert!(state.tables.chunk_data_index.get(&hkey(&chunk_hash)).unwrap().is_none());
    }

    #[test]
    fn confirmed_root_promotes_every_placement_index_only() {
        let (mut state, _db) = test_state();
        let data_root = [5u8; 32];
        let tx_size = 100u64;
        let data_root_key = crate::keys::data_root_key(&data_root, tx_size);

        let mut dre = DataRootEntry::default();
        dre.insert_placement([6u8; 32], 1000, vec![9, 9]);
        state
            .tables
            .data_root_index
            .put(&data_root_key, &encode(&dre).unwrap())
            .unwrap();

        let chunk_hash = [7u8; 32];
        stage(
            &mut state,
            11,
            chunk_hash,
            &DiskPoolChunkEntry {
                chunk_offset_in_tx: 0,
                chunk_size: 100,
                data_root,
                tx_size,
            },
        );

        let handle = super::EngineHandle::test_handle();
        let outcome = step(&mut state, &handle).unwrap();
        assert_eq!(outcome, StepOutcome::MadeProgress);
        assert!(state
            .tables
            .chunks_index
            .get(&crate::keys::offset_key(1000))
            .unwrap()
            .is_some());
        // root was never in `state.disk_pool`, so the staged row is pruned
        // immediately after promotion.
        assert!(state
            .tables
            .disk_pool_chunks_index
            .get(&disk_pool_key(11, &chunk_hash))
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_table_is_idle() {
        let (mut state, _db) = test_state();
        let handle = super::EngineHandle::test_handle();
        assert_eq!(step(&mut state, &handle).unwrap(), StepOutcome::Idle);
    }
}
