/// Join / reorg (§4.6): finding the common ancestor with an incoming chain
/// view, undoing index state for orphaned blocks, and replaying forward.
use std::collections::BTreeSet;

use crate::batch::AtomicBatch;
use crate::block_index::{BlockIndex, BlockIndexEntry};
use crate::keys::offset_key;
use crate::kv::Kv;
use crate::model::{decode, encode, DataRootOffsetEntry};
use crate::types::{AbsoluteOffset, EngineError, Hash32, Result};

use super::state::EngineState;

/// One confirmed block's transactions, each tagged with its size and
/// Merkle placement, as handed to `join`/`add_tip_block`/`add_block`.
pub struct SizeTaggedTx {
    pub tx_id: [u8; 32],
    pub tx_root: [u8; 32],
    pub data_root: [u8; 32],
    pub abs_tx_start: AbsoluteOffset,
    pub abs_tx_end: AbsoluteOffset,
    pub tx_size: u64,
    pub tx_path: Vec<u8>,
}

pub struct BlockTxs {
    pub block_hash: [u8; 32],
    pub block_start_offset: AbsoluteOffset,
    pub block_size: u64,
    pub txs: Vec<SizeTaggedTx>,
}

/// Reorg primitive: deletes everything at or above `block_start_offset`,
/// returning, for every `data_root_index` key that was fully removed, the
/// key together with whatever TXID set the disk pool last knew for it (so
/// callers can re-stage it there preserving that set, §4.6).
pub fn remove_orphaned_data(
    state: &mut EngineState,
    block_start_offset: AbsoluteOffset,
    weave_size: AbsoluteOffset,
) -> Result<Vec<(Vec<u8>, BTreeSet<Hash32>)>> {
    let mut batch = AtomicBatch::new(state.db.clone());

    let lo = offset_key(block_start_offset);
    let hi = offset_key(weave_size + 1);

    for (offset_key_bytes, tx_id_bytes) in state.tables.tx_offset_index.get_range(&lo, &hi)? {
        batch.delete("tx_index", tx_id_bytes);
        let _ = offset_key_bytes;
    }
    batch.delete_range("tx_offset_index", lo.clone(), hi.clone());

    let chunks_lo = offset_key(block_start_offset + 1);
    batch.delete_range("chunks_index", chunks_lo, hi.clone());

    let mut fully_removed = Vec::new();
    for (_offset, value) in state.tables.data_root_offset_index.get_range(&lo, &hi)? {
        let entry: DataRootOffsetEntry = decode(&value)?;
        for data_root_key in entry.data_root_keys {
            let Some(raw) = state.tables.data_root_index.get(&data_root_key)? else {
                continue;
            };
            let mut dre: crate::model::DataRootEntry = decode(&raw)?;
            let became_empty = dre.remove_from(block_start_offset);
            if became_empty {
                batch.delete("data_root_index", data_root_key.clone());
                let tx_ids = state
                    .disk_pool
                    .data_roots
                    .get(&data_root_key)
                    .and_then(|e| e.tx_ids.clone())
                    .unwrap_or_default();
                fully_removed.push((data_root_key, tx_ids));
            } else {
                batch.put("data_root_index", data_root_key, encode(&dre)?);
            }
        }
    }
    batch.delete_range("data_root_offset_index", lo, hi);

    batch.commit()?;
    Ok(fully_removed)
}

/// `join(bi)`: establishes (or re-establishes) the engine's view of the
/// canonical chain.
pub fn join(state: &mut EngineState, incoming: Vec<BlockTxs>, recent_bi: Vec<BlockIndexEntry>) -> Result<()> {
    if state.block_index.is_empty() {
        rebuild_data_root_offset_index(state, &incoming)?;
        state.block_index.replace(recent_bi);
        state.weave_size = state.block_index.weave_size();
        state.joined = true;
        return Ok(());
    }

    let Some((_ancestor_hash, ancestor_weave_size)) = state.block_index.common_ancestor(&recent_bi) else {
        return Err(EngineError::NoCommonAncestor);
    };
    let prev_weave_size = state.block_index.weave_size();
    let removed_keys = remove_orphaned_data(state, ancestor_weave_size, prev_weave_size)?;

    let forward: Vec<&BlockTxs> = incoming
        .iter()
        .filter(|b| b.block_start_offset >= ancestor_weave_size)
        .collect();
    for block in &forward {
        apply_block(state, block)?;
    }

    state.sync_record.cut(ancestor_weave_size);
    for (key, tx_ids) in removed_keys {
        state.disk_pool.restage_pending(key, tx_ids, now_micros());
    }

    state.block_index.replace(recent_bi);
    state.weave_size = state.block_index.weave_size();
    Ok(())
}

/// `add_tip_block`: the same indexing as `join` but for blocks known to
/// extend the current tip, used during catch-up (§4.6).
pub fn add_tip_block(state: &mut EngineState, pairs: Vec<BlockTxs>, recent_bi: Vec<BlockIndexEntry>) -> Result<()> {
    let Some((_ancestor_hash, ancestor_weave_size)) = state.block_index.common_ancestor(&recent_bi) else {
        return Err(EngineError::NoCommonAncestor);
    };
    let weave_size = state.block_index.weave_size();
    let removed_keys = remove_orphaned_data(state, ancestor_weave_size, weave_size)?;

    for block in &pairs {
        apply_block(state, block)?;
    }

    for (key, tx_ids) in removed_keys {
        state.disk_pool.restage_pending(key, tx_ids, now_micros());
    }
    state.sync_record.cut(ancestor_weave_size);
    state.block_index.replace(recent_bi);
    state.weave_size = state.block_index.weave_size();
    Ok(())
}

/// `add_block`: index a single block known to extend the tip (catch-up).
pub fn add_block(state: &mut EngineState, block: BlockTxs, entry: BlockIndexEntry) -> Result<()> {
    apply_block(state, &block)?;
    state.block_index.push(entry);
    state.weave_size = state.block_index.weave_size();
    Ok(())
}

fn apply_block(state: &mut EngineState, block: &BlockTxs) -> Result<()> {
    let mut batch = AtomicBatch::new(state.db.clone());
    let mut data_root_keys = std::collections::BTreeSet::new();

    for tx in &block.txs {
        let data_root_key = crate::keys::data_root_key(&tx.data_root, tx.tx_size);
        let mut entry = match state.tables.data_root_index.get(&data_root_key)? {
            Some(raw) => decode(&raw)?,
            None => crate::model::DataRootEntry::default(),
        };
        entry.insert_placement(tx.tx_root, tx.abs_tx_start, tx.tx_path.clone());
        batch.put("data_root_index", data_root_key.clone(), encode(&entry)?);
        data_root_keys.insert(data_root_key);

        batch.put(
            "tx_index",
            tx.tx_id.to_vec(),
            encode(&crate::model::TxIndexEntry {
                abs_tx_end_offset: tx.abs_tx_end,
                tx_size: tx.tx_size,
            })?,
        );
        batch.put(
            "tx_offset_index",
            offset_key(tx.abs_tx_start),
            tx.tx_id.to_vec(),
        );
    }

    let offset_entry = DataRootOffsetEntry {
        tx_root: block.txs.first().map(|t| t.tx_root).unwrap_or([0u8; 32]),
        block_size: block.block_size,
        data_root_keys,
    };
    batch.put(
        "data_root_offset_index",
        offset_key(block.block_start_offset),
        encode(&offset_entry)?,
    );
    batch.commit()
}

fn rebuild_data_root_offset_index(state: &mut EngineState, blocks: &[BlockTxs]) -> Result<()> {
    for block in blocks {
        apply_block(state, block)?;
    }
    Ok(())
}

fn now_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;

    fn tx(id: u8, root: u8, droot: u8, start: u64, end: u64, size: u64) -> SizeTaggedTx {
        SizeTaggedTx {
            tx_id: [id; 32],
            tx_root: [root; 32],
            data_root: [droot; 32],
            abs_tx_start: start,
            abs_tx_end: end,
            tx_size: size,
            tx_path: vec![1, 2],
        }
    }

    #[test]
    fn join_on_empty_block_index_indexes_every_block() {
        let (mut state, _db) = test_state();
        state.block_index = BlockIndex::new();
        let block = BlockTxs {
            block_hash: [1u8; 32],
            block_start_offset: 0,
            block_size: 100,
            txs: vec![tx(1, 1, 1, 0, 100, 100)],
        };
        let recent = vec![BlockIndexEntry {
            block_hash: [1u8; 32],
            weave_size: 100,
            tx_root: [1u8; 32],
        }];
        join(&mut state, vec![block], recent).unwrap();
        assert_eq!(state.weave_size, 100);
        assert!(state.tables.tx_index.get(&[1u8; 32]).unwrap().is_some());
    }

    #[test]
    fn reorg_removes_rows_above_the_common_ancestor() {
        let (mut state, _db) = test_state();
        state.block_index = BlockIndex::new();
        let b1 = BlockTxs {
            block_hash: [1u8; 32],
            block_start_offset: 0,
            block_size: 100,
            txs: vec![tx(1, 1, 1, 0, 100, 100)],
        };
        let b2 = BlockTxs {
            block_hash: [2u8; 32],
            block_start_offset: 100,
            block_size: 100,
            txs: vec![tx(2, 2, 2, 100, 200, 100)],
        };
        join(
            &mut state,
            vec![b1],
            vec![BlockIndexEntry { block_hash: [1u8; 32], weave_size: 100, tx_root: [1u8; 32] }],
        )
        .unwrap();
        add_tip_block(
            &mut state,
            vec![b2],
            vec![
                BlockIndexEntry { block_hash: [1u8; 32], weave_size: 100, tx_root: [1u8; 32] },
                BlockIndexEntry { block_hash: [2u8; 32], weave_size: 200, tx_root: [2u8; 32] },
            ],
        )
        .unwrap();
        assert!(state.tables.tx_index.get(&[2u8; 32]).unwrap().is_some());

        // orphan B2 with a different B2'.
        let b2_prime = BlockTxs {
            block_hash: [9u8; 32],
            block_start_offset: 100,
            block_size: 100,
            txs: vec![tx(3, 3, 3, 100, 200, 100)],
        };
        add_tip_block(
            &mut state,
            vec![b2_prime],
            vec![
                BlockIndexEntry { block_hash: [1u8; 32], weave_size: 100, tx_root: [1u8; 32] },
                BlockIndexEntry { block_hash: [9u8; 32], weave_size: 200, tx_root: [3u8; 32] },
            ],
        )
        .unwrap();

        assert!(state.tables.tx_index.get(&[2u8; 32]).unwrap().is_none());
        assert!(state.tables.tx_index.get(&[3u8; 32]).unwrap().is_some());
    }
}
