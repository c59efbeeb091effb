/// Blacklisted erasure (§4.8): the only path that intentionally punches
/// holes inside an already-synced range.
use crate::batch::AtomicBatch;
use crate::keys::{decode_offset_key, hash_key, offset_key};
use crate::kv::Kv;
use crate::model::{decode, ChunkIndexEntry, TxIndexEntry};
use crate::types::{Hash32, Result};

use super::state::EngineState;

pub async fn request_tx_data_removal(state: &mut EngineState, tx_id: &Hash32) -> Result<()> {
    let Some(raw) = state.tables.tx_index.get(tx_id)? else {
        // idempotent: a second call (or a call for an unknown tx) is a no-op.
        return Ok(());
    };
    let TxIndexEntry { abs_tx_end_offset, tx_size } = decode(&raw)?;
    let tx_start = abs_tx_end_offset - tx_size;

    let mut batch = AtomicBatch::new(state.db.clone());
    let mut cursor = offset_key(tx_start + 1);
    loop {
        let Some((key, value)) = state.tables.chunks_index.get_next(&cursor)? else {
            break;
        };
        let Some(offset) = decode_offset_key(&key) else { break };
        if offset > abs_tx_end_offset {
            break;
        }
        let entry: ChunkIndexEntry = decode(&value)?;
        batch.delete("chunks_index", key.clone());
        batch.delete("chunk_data_index", hash_key(&entry.data_path_hash));
        state.sync_record.delete(offset - entry.chunk_size, offset);

        cursor = offset_key(offset + 1);
    }
    batch.commit()?;

    state.blacklist.notify_about_removed_tx_data(tx_id).await?;
    Ok(())
}
