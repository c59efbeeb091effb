/// Migration `store_data_in_v2_index` (§4.9): moving chunk bytes out of a
/// legacy file-per-hash store and into `chunk_data_index`, with a persisted
/// cursor so the walk survives a restart.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::batch::AtomicBatch;
use crate::constants::{MIGRATION_COMPLETE, MIGRATION_RETRY_DELAY_MS, MIGRATION_STORE_DATA_IN_V2_INDEX};
use crate::keys::{decode_offset_key, hash_key};
use crate::kv::Kv;
use crate::model::{decode, encode, ChunkDataEntry, ChunkIndexEntry};
use crate::types::Result;

use super::state::EngineState;

/// Process-wide flag mirroring `migrations_index`'s persisted marker, so
/// read paths can skip consulting the legacy store once the migration is
/// done without touching the KV on every read.
pub static MIGRATION_V2_COMPLETE: AtomicBool = AtomicBool::new(false);

pub fn is_complete() -> bool {
    MIGRATION_V2_COMPLETE.load(Ordering::Acquire)
}

pub fn legacy_chunk_path(legacy_dir: &Path, data_path_hash: &[u8; 32]) -> PathBuf {
    legacy_dir.join(hex::encode(data_path_hash))
}

/// One migration step: move a single chunk's bytes, advance the cursor.
/// Returns `false` once the keyspace has been fully walked.
pub fn step(state: &mut EngineState, legacy_dir: &Path, cursor: &[u8]) -> Result<(Vec<u8>, bool)> {
    let Some((key, _next, next_cursor)) = state.tables.chunks_index.iter_from(cursor)? else {
        return Ok((cursor.to_vec(), false));
    };
    let entry_value = state.tables.chunks_index.get(&key)?;
    let Some(raw) = entry_value else {
        return Ok((next_cursor, true));
    };
    let entry: ChunkIndexEntry = decode(&raw)?;
    let legacy_path = legacy_chunk_path(legacy_dir, &entry.data_path_hash);

    if state.tables.chunk_data_index.get(&hash_key(&entry.data_path_hash))?.is_none() {
        if let Ok(chunk_bytes) = std::fs::read(&legacy_path) {
            let mut batch = AtomicBatch::new(state.db.clone());
            batch.put(
                "chunk_data_index",
                hash_key(&entry.data_path_hash),
                encode(&ChunkDataEntry {
                    chunk_bytes,
                    data_path_bytes: Vec::new(),
                })?,
            );
            batch.commit()?;
            let _ = std::fs::remove_file(&legacy_path);
        }
    }

    let done = decode_offset_key(&next_cursor).map(|o| o == 0).unwrap_or(false);
    Ok((next_cursor, !done))
}

/// Persists the migration cursor, or `"complete"` once the walk wraps back
/// to the start having made one full pass with no remaining legacy files.
pub fn persist_progress(state: &EngineState, cursor: &[u8], complete: bool) -> Result<()> {
    let value = if complete {
        MIGRATION_COMPLETE.as_bytes().to_vec()
    } else {
        cursor.to_vec()
    };
    state
        .tables
        .migrations_index
        .put(MIGRATION_STORE_DATA_IN_V2_INDEX.as_bytes(), &value)
}

pub fn load_progress(state: &EngineState) -> Result<Option<Vec<u8>>> {
    state.tables.migrations_index.get(MIGRATION_STORE_DATA_IN_V2_INDEX.as_bytes())
}

/// Runs the migration to completion in a background task, retrying on
/// error after `MIGRATION_RETRY_DELAY_MS`. `state` must not be touched by
/// any other task concurrently with this one — the engine actor spawns this
/// only after handing off a state that won't be mutated elsewhere for
/// table/legacy-store purposes.
pub async fn run_in_background(db: Arc<rocksdb::DB>, legacy_dir: PathBuf) {
    if let Some(raw) = RocksMigrationProgress::new(db.clone()).load().ok().flatten() {
        if raw == MIGRATION_COMPLETE.as_bytes() {
            MIGRATION_V2_COMPLETE.store(true, Ordering::Release);
            return;
        }
    }

    loop {
        match run_pass(db.clone(), &legacy_dir).await {
            Ok(()) => {
                MIGRATION_V2_COMPLETE.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "migration pass failed, retrying");
                tokio::time::sleep(Duration::from_millis(MIGRATION_RETRY_DELAY_MS)).await;
            }
        }
    }
}

struct RocksMigrationProgress {
    kv: crate::kv::RocksKv,
}

impl RocksMigrationProgress {
    fn new(db: Arc<rocksdb::DB>) -> Self {
        Self {
            kv: crate::kv::RocksKv::new(db, "migrations_index"),
        }
    }
    fn load(&self) -> Result<Option<Vec<u8>>> {
        self.kv.get(MIGRATION_STORE_DATA_IN_V2_INDEX.as_bytes())
    }
}

async fn run_pass(db: Arc<rocksdb::DB>, legacy_dir: &Path) -> Result<()> {
    let progress = RocksMigrationProgress::new(db.clone());
    let mut cursor = progress.load()?.unwrap_or_default();
    loop {
        let chunks_index = crate::kv::RocksKv::new(db.clone(), "chunks_index");
        let Some((key, value, next)) = chunks_index.iter_from(&cursor)? else {
            break;
        };
        let entry: ChunkIndexEntry = decode(&value)?;
        let chunk_data_index = crate::kv::RocksKv::new(db.clone(), "chunk_data_index");
        let legacy_path = legacy_chunk_path(legacy_dir, &entry.data_path_hash);
        if chunk_data_index.get(&hash_key(&entry.data_path_hash))?.is_none() {
            if let Ok(chunk_bytes) = std::fs::read(&legacy_path) {
                chunk_data_index.put(
                    &hash_key(&entry.data_path_hash),
                    &encode(&ChunkDataEntry {
                        chunk_bytes,
                        data_path_bytes: Vec::new(),
                    })?,
                )?;
                let _ = std::fs::remove_file(&legacy_path);
            }
        }
        progress.kv.put(MIGRATION_STORE_DATA_IN_V2_INDEX.as_bytes(), &next)?;
        let _ = key;
        cursor = next;
        if decode_offset_key(&cursor).map(|o| o == 0).unwrap_or(false) {
            break;
        }
    }
    progress.kv.put(
        MIGRATION_STORE_DATA_IN_V2_INDEX.as_bytes(),
        MIGRATION_COMPLETE.as_bytes(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::test_state;
    use tempfile::TempDir;

    #[test]
    fn migration_moves_legacy_bytes_into_chunk_data_index() {
        let (mut state, _db) = test_state();
        let legacy_dir = TempDir::new().unwrap();

        let hash = [9u8; 32];
        std::fs::write(legacy_chunk_path(legacy_dir.path(), &hash), b"legacy-bytes").unwrap();

        state
            .tables
            .chunks_index
            .put(
                &crate::keys::offset_key(100),
                &encode(&ChunkIndexEntry {
                    data_path_hash: hash,
                    tx_root: [0u8; 32],
                    data_root: [0u8; 32],
                    tx_path: vec![],
                    chunk_offset_in_tx: 0,
                    chunk_size: 100,
                })
                .unwrap(),
            )
            .unwrap();

        let (_next, _more) = step(&mut state, legacy_dir.path(), &[0u8; 8]).unwrap();
        let moved = state.tables.chunk_data_index.get(&hash_key(&hash)).unwrap();
        assert!(moved.is_some());
        assert!(!legacy_chunk_path(legacy_dir.path(), &hash).exists());
    }
}
