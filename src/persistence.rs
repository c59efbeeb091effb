/// Persisted sidecar state (§6): `(sync_record, block_index,
/// disk_pool_data_roots, disk_pool_size, compacted_size)`, bincode-encoded.
/// A legacy 4-tuple written before `compacted_size` existed must still load,
/// with the missing field treated as zero.
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::block_index::{BlockIndex, BlockIndexEntry};
use crate::disk_pool::{DataRootKey, DiskPoolRootEntry};
use crate::interval_set::IntervalSet;
use crate::sync_record::{from_binary_terms, to_binary_terms};
use crate::types::Result;

/// Sidecar file name, relative to `db_path`.
pub const SYNC_STATE_FILE: &str = "sync_state";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedStateV2 {
    sync_record: Vec<u8>,
    block_index: Vec<BlockIndexEntryDto>,
    disk_pool_data_roots: Vec<(DataRootKey, DiskPoolRootEntry)>,
    disk_pool_size: u64,
    compacted_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedStateV1Legacy {
    sync_record: Vec<u8>,
    block_index: Vec<BlockIndexEntryDto>,
    disk_pool_data_roots: Vec<(DataRootKey, DiskPoolRootEntry)>,
    disk_pool_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockIndexEntryDto {
    block_hash: [u8; 32],
    weave_size: u64,
    tx_root: [u8; 32],
}

impl From<&BlockIndexEntry> for BlockIndexEntryDto {
    fn from(e: &BlockIndexEntry) -> Self {
        Self {
            block_hash: e.block_hash,
            weave_size: e.weave_size,
            tx_root: e.tx_root,
        }
    }
}

impl From<BlockIndexEntryDto> for BlockIndexEntry {
    fn from(d: BlockIndexEntryDto) -> Self {
        Self {
            block_hash: d.block_hash,
            weave_size: d.weave_size,
            tx_root: d.tx_root,
        }
    }
}

pub struct PersistedState {
    pub sync_record: IntervalSet,
    pub block_index: BlockIndex,
    pub disk_pool_data_roots: Vec<(DataRootKey, DiskPoolRootEntry)>,
    pub disk_pool_size: u64,
    pub compacted_size: u64,
}

pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    let mut block_index = Vec::new();
    for e in state.block_index.entries() {
        block_index.push(BlockIndexEntryDto::from(e));
    }
    let dto = PersistedStateV2 {
        sync_record: to_binary_terms(&state.sync_record),
        block_index,
        disk_pool_data_roots: state.disk_pool_data_roots.clone(),
        disk_pool_size: state.disk_pool_size,
        compacted_size: state.compacted_size,
    };
    let bytes = bincode::serialize(&dto)?;
    std::fs::write(path, bytes).map_err(|e| crate::types::EngineError::Storage(e.to_string()))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Option<PersistedState>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(crate::types::EngineError::Storage(e.to_string())),
    };

    if let Ok(v2) = bincode::deserialize::<PersistedStateV2>(&bytes) {
        return Ok(Some(from_v2(v2)));
    }
    // fall back to the legacy 4-tuple shape, treating compacted_size as 0.
    let v1: PersistedStateV1Legacy = bincode::deserialize(&bytes)?;
    Ok(Some(from_v2(PersistedStateV2 {
        sync_record: v1.sync_record,
        block_index: v1.block_index,
        disk_pool_data_roots: v1.disk_pool_data_roots,
        disk_pool_size: v1.disk_pool_size,
        compacted_size: 0,
    })))
}

fn from_v2(dto: PersistedStateV2) -> PersistedState {
    let sync_record = from_binary_terms(&dto.sync_record).unwrap_or_default();
    let mut block_index = BlockIndex::new();
    block_index.replace(dto.block_index.into_iter().map(BlockIndexEntry::from).collect());
    PersistedState {
        sync_record,
        block_index,
        disk_pool_data_roots: dto.disk_pool_data_roots,
        disk_pool_size: dto.disk_pool_size,
        compacted_size: dto.compacted_size,
    }
}
