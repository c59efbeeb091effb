use crate::constants::COLUMN_FAMILIES;
use rocksdb::DB;
use std::sync::Arc;

/// Cached column family handles for efficient access.
///
/// Validates that all nine tables from the data model exist at startup so a
/// missing column family fails fast instead of surfacing as a `cf_handle`
/// panic deep inside a handler.
#[derive(Clone)]
pub struct DbHandles {
    db: Arc<DB>,
}

impl DbHandles {
    pub fn new(db: Arc<DB>) -> Result<Self, String> {
        for cf_name in COLUMN_FAMILIES {
            if db.cf_handle(cf_name).is_none() {
                return Err(format!("{} column family not found", cf_name));
            }
        }
        Ok(Self { db })
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    pub fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| panic!("{} column family missing after validation", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    #[test]
    fn rejects_missing_column_family() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, dir.path(), ["default"]).unwrap();
        assert!(DbHandles::new(Arc::new(db)).is_err());
    }

    #[test]
    fn accepts_all_nine_column_families() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let mut descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        for cf in COLUMN_FAMILIES {
            descriptors.push(ColumnFamilyDescriptor::new(cf, Options::default()));
        }
        let db = DB::open_cf_descriptors(&opts, dir.path(), descriptors).unwrap();
        assert!(DbHandles::new(Arc::new(db)).is_ok());
    }
}
