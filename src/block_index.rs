/// The engine's trailing window over the canonical chain: the most recent
/// `TRACK_CONFIRMATIONS` `(block_hash, weave_size, tx_root)` entries, used to
/// find the common ancestor on `join` and to know the current tip's weave
/// size (§3, invariant 6).
use crate::constants::TRACK_CONFIRMATIONS;
use crate::types::Hash32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub block_hash: Hash32,
    pub weave_size: u64,
    pub tx_root: Hash32,
}

/// Ordered oldest-to-newest; `head()` is the most recently confirmed block.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<&BlockIndexEntry> {
        self.entries.last()
    }

    pub fn weave_size(&self) -> u64 {
        self.head().map(|e| e.weave_size).unwrap_or(0)
    }

    pub fn entries(&self) -> &[BlockIndexEntry] {
        &self.entries
    }

    /// Appends `entry` and trims to the most recent `TRACK_CONFIRMATIONS`.
    pub fn push(&mut self, entry: BlockIndexEntry) {
        debug_assert!(
            self.head().map(|h| entry.weave_size > h.weave_size).unwrap_or(true),
            "block_index must stay monotonically increasing in offset"
        );
        self.entries.push(entry);
        if self.entries.len() > TRACK_CONFIRMATIONS {
            let drop = self.entries.len() - TRACK_CONFIRMATIONS;
            self.entries.drain(0..drop);
        }
    }

    pub fn replace(&mut self, entries: Vec<BlockIndexEntry>) {
        self.entries = entries;
        if self.entries.len() > TRACK_CONFIRMATIONS {
            let drop = self.entries.len() - TRACK_CONFIRMATIONS;
            self.entries.drain(0..drop);
        }
    }

    /// Finds the deepest common ancestor between `self` and `incoming`,
    /// comparing by `block_hash`. Returns `(block_hash, weave_size)` of the
    /// shared entry.
    pub fn common_ancestor(&self, incoming: &[BlockIndexEntry]) -> Option<(Hash32, u64)> {
        let incoming_hashes: std::collections::HashSet<Hash32> =
            incoming.iter().map(|e| e.block_hash).collect();
        self.entries
            .iter()
            .rev()
            .find(|e| incoming_hashes.contains(&e.block_hash))
            .map(|e| (e.block_hash, e.weave_size))
    }
}
