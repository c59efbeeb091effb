/// In-memory bookkeeping for the disk pool: which data roots are pending,
/// how big the staging area is, and expiry by wall-clock timestamp (§3, §4.5).
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::Hash32;

pub type DataRootKey = Vec<u8>; // data_root || tx_size, see keys::data_root_key

/// `None` in `tx_ids` means the root has been confirmed at least once and
/// must never expire again, even once its staged chunks are gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPoolRootEntry {
    pub total_bytes: u64,
    pub first_seen_ts_us: u128,
    pub tx_ids: Option<BTreeSet<Hash32>>,
}

impl DiskPoolRootEntry {
    pub fn confirmed(&self) -> bool {
        self.tx_ids.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPoolState {
    pub data_roots: BTreeMap<DataRootKey, DiskPoolRootEntry>,
    pub disk_pool_size: u64,
    pub max_buffer_bytes: u64,
    pub max_per_root_bytes: u64,
}

pub enum AdmissionError {
    ExceedsDiskPoolSizeLimit,
}

impl DiskPoolState {
    pub fn new(max_buffer_bytes: u64, max_per_root_bytes: u64) -> Self {
        Self {
            data_roots: BTreeMap::new(),
            disk_pool_size: 0,
            max_buffer_bytes,
            max_per_root_bytes,
        }
    }

    pub fn contains(&self, key: &DataRootKey) -> bool {
        self.data_roots.contains_key(key)
    }

    pub fn mark_pending(&mut self, key: DataRootKey, tx_id: Hash32, now_us: u128) {
        self.data_roots
            .entry(key)
            .and_modify(|e| {
                if let Some(ids) = e.tx_ids.as_mut() {
                    ids.insert(tx_id);
                }
            })
            .or_insert_with(|| DiskPoolRootEntry {
                total_bytes: 0,
                first_seen_ts_us: now_us,
                tx_ids: Some([tx_id].into_iter().collect()),
            });
    }

    /// Marks a root confirmed: future expiration ticks skip it even after
    /// all its tx-ids are gone, and re-seeds a fresh timestamp.
    pub fn confirm(&mut self, key: DataRootKey, now_us: u128) {
        let entry = self.data_roots.entry(key).or_insert_with(|| DiskPoolRootEntry {
            total_bytes: 0,
            first_seen_ts_us: now_us,
            tx_ids: None,
        });
        entry.tx_ids = None;
        entry.first_seen_ts_us = now_us;
    }

    /// Re-stages a root that a reorg just orphaned: it is pending again
    /// (not confirmed), with a fresh timestamp so it gets a full expiration
    /// window, but keeps whatever TXID set it was last known to have (§4.6).
    /// Staged byte totals, if any, are kept as-is.
    pub fn restage_pending(&mut self, key: DataRootKey, tx_ids: BTreeSet<Hash32>, now_us: u128) {
        let entry = self.data_roots.entry(key).or_insert_with(|| DiskPoolRootEntry {
            total_bytes: 0,
            first_seen_ts_us: now_us,
            tx_ids: Some(BTreeSet::new()),
        });
        entry.first_seen_ts_us = now_us;
        entry.tx_ids = Some(tx_ids);
    }

    pub fn maybe_drop_tx(&mut self, key: &DataRootKey, tx_id: &Hash32) {
        if let Some(entry) = self.data_roots.get_mut(key) {
            if let Some(ids) = entry.tx_ids.as_mut() {
                ids.remove(tx_id);
                if ids.is_empty() {
                    self.disk_pool_size = self.disk_pool_size.saturating_sub(entry.total_bytes);
                    self.data_roots.remove(key);
                }
            }
        }
    }

    /// Admission check for a new chunk under `key`: hard caps on per-root
    /// and global staged bytes.
    pub fn check_admission(&self, key: &DataRootKey, additional_bytes: u64) -> Result<(), AdmissionError> {
        let current_root_bytes = self.data_roots.get(key).map(|e| e.total_bytes).unwrap_or(0);
        if current_root_bytes + additional_bytes > self.max_per_root_bytes {
            return Err(AdmissionError::ExceedsDiskPoolSizeLimit);
        }
        if self.disk_pool_size + additional_bytes > self.max_buffer_bytes {
            return Err(AdmissionError::ExceedsDiskPoolSizeLimit);
        }
        Ok(())
    }

    pub fn record_bytes(&mut self, key: &DataRootKey, bytes: u64) {
        if let Some(entry) = self.data_roots.get_mut(key) {
            entry.total_bytes += bytes;
        }
        self.disk_pool_size += bytes;
    }

    /// Drops every root whose staging period has elapsed without
    /// confirmation, recomputing `disk_pool_size` from the survivors.
    pub fn expire(&mut self, now_us: u128, expiration_us: u128) -> Vec<DataRootKey> {
        let mut expired = Vec::new();
        self.data_roots.retain(|key, entry| {
            let keep = entry.confirmed() || entry.first_seen_ts_us + expiration_us >= now_us;
            if !keep {
                expired.push(key.clone());
            }
            keep
        });
        self.disk_pool_size = self.data_roots.values().map(|e| e.total_bytes).sum();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_rejects_beyond_global_cap() {
        let mut pool = DiskPoolState::new(100, 100);
        let key = vec![1u8];
        pool.record_bytes(&key, 90);
        assert!(pool.check_admission(&key, 20).is_err());
        assert!(pool.check_admission(&key, 5).is_ok());
    }

    #[test]
    fn confirmed_roots_never_expire() {
        let mut pool = DiskPoolState::new(1_000, 1_000);
        let key = vec![2u8];
        pool.confirm(key.clone(), 0);
        let expired = pool.expire(1_000_000_000, 10);
        assert!(expired.is_empty());
        assert!(pool.contains(&key));
    }

    #[test]
    fn unconfirmed_roots_expire_after_the_window() {
        let mut pool = DiskPoolState::new(1_000, 1_000);
        let key = vec![3u8];
        pool.mark_pending(key.clone(), [9u8; 32], 0);
        let expired = pool.expire(1_000, 100);
        assert_eq!(expired, vec![key.clone()]);
        assert!(!pool.contains(&key));
    }

    #[test]
    fn dropping_last_tx_id_removes_unconfirmed_entry() {
        let mut pool = DiskPoolState::new(1_000, 1_000);
        let key = vec![4u8];
        let tx = [1u8; 32];
        pool.mark_pending(key.clone(), tx, 0);
        pool.record_bytes(&key, 50);
        pool.maybe_drop_tx(&key, &tx);
        assert!(!pool.contains(&key));
        assert_eq!(pool.disk_pool_size, 0);
    }
}
