/// Process-wide, read-only table registry.
///
/// §4.1 calls out that read-only lookups (`get_chunk`, `get_tx_root`, ...)
/// must not round-trip through the engine's mailbox. They instead borrow KV
/// handles published here once at startup, generalizing the teacher's
/// `lazy_static! DB_MUTEX`/`db_handles` pattern to a typed, explicit
/// registry instead of a bare global mutex.
use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::db_handles::DbHandles;
use crate::kv::RocksKv;

static REGISTRY: OnceCell<TableRegistry> = OnceCell::new();

pub struct TableRegistry {
    pub chunks_index: RocksKv,
    pub chunk_data_index: RocksKv,
    pub data_root_index: RocksKv,
    pub data_root_offset_index: RocksKv,
    pub tx_index: RocksKv,
    pub tx_offset_index: RocksKv,
}

impl TableRegistry {
    pub fn from_handles(handles: &DbHandles) -> Self {
        let db = Arc::clone(handles.db());
        Self {
            chunks_index: RocksKv::new(db.clone(), "chunks_index"),
            chunk_data_index: RocksKv::new(db.clone(), "chunk_data_index"),
            data_root_index: RocksKv::new(db.clone(), "data_root_index"),
            data_root_offset_index: RocksKv::new(db.clone(), "data_root_offset_index"),
            tx_index: RocksKv::new(db.clone(), "tx_index"),
            tx_offset_index: RocksKv::new(db, "tx_offset_index"),
        }
    }
}

/// Publishes `registry` for the life of the process. Intended to be called
/// exactly once at startup; later calls are ignored (mirrors `OnceCell`'s
/// own semantics rather than panicking, since tests may construct the
/// engine more than once in the same process).
pub fn publish(registry: TableRegistry) {
    let _ = REGISTRY.set(registry);
}

pub fn get() -> &'static TableRegistry {
    REGISTRY
        .get()
        .expect("table registry not published — call registry::publish() during startup")
}
