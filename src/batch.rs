/// Atomic multi-column-family database writer.
///
/// Every multi-table update the engine performs (§4.3 store-chunk,
/// §4.6 reorg, §4.7 compaction, §4.8 blacklisted erasure) must land as one
/// RocksDB `WriteBatch`: either all of it commits or none does, which is
/// what keeps invariant 5 ("data_root_offset_index row implies
/// data_root_index row") true even across a crash mid-update.
use rocksdb::{WriteBatch, DB};
use std::sync::Arc;

use crate::types::{EngineError, Result};

enum Operation {
    Put {
        cf_name: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: &'static str,
        key: Vec<u8>,
    },
    DeleteRange {
        cf_name: &'static str,
        from: Vec<u8>,
        to: Vec<u8>,
    },
}

/// Accumulates writes across the nine tables and commits them together.
pub struct AtomicBatch {
    db: Arc<DB>,
    operations: Vec<Operation>,
}

impl AtomicBatch {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            db,
            operations: Vec::new(),
        }
    }

    pub fn put(&mut self, cf_name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Put {
            cf_name,
            key,
            value,
        });
    }

    pub fn delete(&mut self, cf_name: &'static str, key: Vec<u8>) {
        self.operations.push(Operation::Delete { cf_name, key });
    }

    /// Deletes every key in `[from, to)` in `cf_name`. RocksDB's native
    /// `delete_range` is exclusive of `to`, matching the half-open intervals
    /// used throughout the data model.
    pub fn delete_range(&mut self, cf_name: &'static str, from: Vec<u8>, to: Vec<u8>) {
        self.operations.push(Operation::DeleteRange {
            cf_name,
            from,
            to,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Commit every accumulated operation in a single atomic `WriteBatch`.
    pub fn commit(self) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for op in &self.operations {
            match op {
                Operation::Put {
                    cf_name,
                    key,
                    value,
                } => {
                    let cf = self
                        .db
                        .cf_handle(cf_name)
                        .ok_or_else(|| EngineError::Storage(format!("missing cf {}", cf_name)))?;
                    batch.put_cf(&cf, key, value);
                }
                Operation::Delete { cf_name, key } => {
                    let cf = self
                        .db
                        .cf_handle(cf_name)
                        .ok_or_else(|| EngineError::Storage(format!("missing cf {}", cf_name)))?;
                    batch.delete_cf(&cf, key);
                }
                Operation::DeleteRange { cf_name, from, to } => {
                    let cf = self
                        .db
                        .cf_handle(cf_name)
                        .ok_or_else(|| EngineError::Storage(format!("missing cf {}", cf_name)))?;
                    batch.delete_range_cf(&cf, from, to);
                }
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    fn open_test_db() -> (Arc<DB>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new("cf1", Options::default()),
            ColumnFamilyDescriptor::new("cf2", Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, dir.path(), descriptors).unwrap();
        (Arc::new(db), dir)
    }

    #[test]
    fn commits_across_multiple_cfs_atomically() {
        let (db, _dir) = open_test_db();
        let mut batch = AtomicBatch::new(db.clone());
        batch.put("cf1", b"k1".to_vec(), b"v1".to_vec());
        batch.put("cf2", b"k2".to_vec(), b"v2".to_vec());
        batch.commit().unwrap();

        let cf1 = db.cf_handle("cf1").unwrap();
        let cf2 = db.cf_handle("cf2").unwrap();
        assert_eq!(db.get_cf(&cf1, b"k1").unwrap().unwrap(), b"v1");
        assert_eq!(db.get_cf(&cf2, b"k2").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn delete_range_is_exclusive_of_upper_bound() {
        let (db, _dir) = open_test_db();
        let cf1 = db.cf_handle("cf1").unwrap();
        for k in 0u64..5 {
            db.put_cf(&cf1, k.to_be_bytes(), b"x").unwrap();
        }
        let mut batch = AtomicBatch::new(db.clone());
        batch.delete_range("cf1", 1u64.to_be_bytes().to_vec(), 3u64.to_be_bytes().to_vec());
        batch.commit().unwrap();

        assert!(db.get_cf(&cf1, 0u64.to_be_bytes()).unwrap().is_some());
        assert!(db.get_cf(&cf1, 1u64.to_be_bytes()).unwrap().is_none());
        assert!(db.get_cf(&cf1, 2u64.to_be_bytes()).unwrap().is_none());
        assert!(db.get_cf(&cf1, 3u64.to_be_bytes()).unwrap().is_some());
        assert!(db.get_cf(&cf1, 4u64.to_be_bytes()).unwrap().is_some());
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let (db, _dir) = open_test_db();
        let batch = AtomicBatch::new(db);
        assert!(batch.is_empty());
        batch.commit().unwrap();
    }
}
