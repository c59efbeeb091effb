/// Ordered binary-key/binary-value store abstraction.
///
/// The engine only ever talks to tables through this trait; `RocksKv` is the
/// concrete column-family-scoped implementation used outside tests. Keeping
/// the trait narrow (get/put/delete/delete_range/get_next/get_prev/get_range
/// plus the cyclic `iter_from`) is what lets `sync_scheduler` and the
/// migration walker be written once and exercised against an in-memory fake.
use rocksdb::{Direction, IteratorMode, DB};
use std::sync::Arc;

use crate::types::{EngineError, Result};

pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn delete_range(&self, from: &[u8], to: &[u8]) -> Result<()>;
    /// Smallest key `>= key`.
    fn get_next(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// Largest key `<= key`.
    fn get_prev(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn get_range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Cyclic iteration: next entry at or after `cursor`, wrapping to the
    /// smallest key once the keyspace is exhausted. Returns `None` only when
    /// the table is entirely empty.
    fn iter_from(&self, cursor: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>>;
}

/// A single column family of a shared RocksDB handle.
pub struct RocksKv {
    db: Arc<DB>,
    cf_name: &'static str,
}

impl RocksKv {
    pub fn new(db: Arc<DB>, cf_name: &'static str) -> Self {
        Self { db, cf_name }
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(self.cf_name)
            .ok_or_else(|| EngineError::Storage(format!("missing cf {}", self.cf_name)))
    }
}

impl Kv for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf()?, key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete_cf(self.cf()?, key)?;
        Ok(())
    }

    fn delete_range(&self, from: &[u8], to: &[u8]) -> Result<()> {
        self.db.delete_range_cf(self.cf()?, from, to)?;
        Ok(())
    }

    fn get_next(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf()?;
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(key, Direction::Forward));
        match iter.next() {
            Some(Ok((k, v))) => Ok(Some((k.to_vec(), v.to_vec()))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn get_prev(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf()?;
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(key, Direction::Reverse));
        match iter.next() {
            Some(Ok((k, v))) => Ok(Some((k.to_vec(), v.to_vec()))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn get_range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(lo, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if k.as_ref() >= hi {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn iter_from(&self, cursor: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>> {
        let cf = self.cf()?;
        if let Some((k, v)) = self.get_next(cursor)? {
            let mut next = k.clone();
            increment_key(&mut next);
            return Ok(Some((k, v, next)));
        }
        // wrap around to the smallest key.
        let mut iter = self.db.iterator_cf(cf, IteratorMode::Start);
        match iter.next() {
            Some(Ok((k, v))) => {
                let mut next = k.to_vec();
                increment_key(&mut next);
                Ok(Some((k.to_vec(), v.to_vec(), next)))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Smallest key strictly greater than `key`, used to advance `iter_from`'s
/// cursor past the entry just returned.
fn increment_key(key: &mut Vec<u8>) {
    for byte in key.iter_mut().rev() {
        if *byte == 0xFF {
            *byte = 0;
            continue;
        }
        *byte += 1;
        return;
    }
    key.push(0);
}
