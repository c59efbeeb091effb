/// Value types stored in the nine tables of §3, plus the bincode
/// encode/decode helpers used to move them in and out of the KV.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{AbsoluteOffset, Hash32, Result};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// `chunks_index` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub data_path_hash: Hash32,
    pub tx_root: Hash32,
    pub data_root: Hash32,
    pub tx_path: Vec<u8>,
    pub chunk_offset_in_tx: u64,
    pub chunk_size: u64,
}

/// `chunk_data_index` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDataEntry {
    pub chunk_bytes: Vec<u8>,
    pub data_path_bytes: Vec<u8>,
}

/// `data_root_index` value: `tx_root -> { abs_tx_start_offset -> tx_path }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRootEntry {
    pub placements: BTreeMap<Hash32, BTreeMap<AbsoluteOffset, Vec<u8>>>,
}

impl DataRootEntry {
    pub fn insert_placement(&mut self, tx_root: Hash32, abs_tx_start: AbsoluteOffset, tx_path: Vec<u8>) {
        self.placements.entry(tx_root).or_default().insert(abs_tx_start, tx_path);
    }

    /// Drops every placement whose tx-start offset is `>= cutoff`, across all
    /// tx-roots; returns true if the entry became entirely empty.
    pub fn remove_from(&mut self, cutoff: AbsoluteOffset) -> bool {
        let mut empty_roots = Vec::new();
        for (root, starts) in self.placements.iter_mut() {
            starts.retain(|&start, _| start < cutoff);
            if starts.is_empty() {
                empty_roots.push(*root);
            }
        }
        for root in empty_roots {
            self.placements.remove(&root);
        }
        self.placements.is_empty()
    }
}

/// `data_root_offset_index` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRootOffsetEntry {
    pub tx_root: Hash32,
    pub block_size: u64,
    pub data_root_keys: BTreeSet<Vec<u8>>,
}

/// `tx_index` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIndexEntry {
    pub abs_tx_end_offset: AbsoluteOffset,
    pub tx_size: u64,
}

/// `disk_pool_chunks_index` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPoolChunkEntry {
    pub chunk_offset_in_tx: u64,
    pub chunk_size: u64,
    pub data_root: Hash32,
    pub tx_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_index_entry_roundtrips_through_bincode() {
        let entry = ChunkIndexEntry {
            data_path_hash: [1u8; 32],
            tx_root: [2u8; 32],
            data_root: [3u8; 32],
            tx_path: vec![9, 9, 9],
            chunk_offset_in_tx: 0,
            chunk_size: 262_144,
        };
        let bytes = encode(&entry).unwrap();
        let back: ChunkIndexEntry = decode(&bytes).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn data_root_entry_remove_from_drops_empty_tx_roots() {
        let mut entry = DataRootEntry::default();
        entry.insert_placement([1u8; 32], 0, vec![1]);
        entry.insert_placement([1u8; 32], 100_000, vec![2]);
        entry.insert_placement([2u8; 32], 50, vec![3]);

        let became_empty = entry.remove_from(100_000);
        assert!(!became_empty);
        assert_eq!(entry.placements.get(&[1u8; 32]).unwrap().len(), 1);
        // root [2;32]'s only placement started below cutoff so survives.
        assert!(entry.placements.contains_key(&[2u8; 32]));
    }

    #[test]
    fn data_root_entry_remove_from_can_empty_the_whole_entry() {
        let mut entry = DataRootEntry::default();
        entry.insert_placement([1u8; 32], 500, vec![1]);
        let became_empty = entry.remove_from(0);
        assert!(became_empty);
        assert!(entry.placements.is_empty());
    }
}
