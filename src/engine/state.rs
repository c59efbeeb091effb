/// In-memory state the engine actor owns exclusively (§3 "In-memory state
/// of the engine"), plus the KV handles it writes through.
use std::collections::HashMap;
use std::sync::Arc;

use rocksdb::DB;

use crate::blacklist::BlacklistClient;
use crate::block_index::BlockIndex;
use crate::config::EngineConfig;
use crate::disk_pool::DiskPoolState;
use crate::interval_set::IntervalSet;
use crate::kv::RocksKv;
use crate::merkle::MerkleVerify;
use crate::peer_client::{Peer, PeerClient};

pub struct EngineTables {
    pub chunks_index: RocksKv,
    pub chunk_data_index: RocksKv,
    pub data_root_index: RocksKv,
    pub data_root_offset_index: RocksKv,
    pub tx_index: RocksKv,
    pub tx_offset_index: RocksKv,
    pub disk_pool_chunks_index: RocksKv,
    pub missing_chunks_index: RocksKv,
    pub migrations_index: RocksKv,
}

impl EngineTables {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            chunks_index: RocksKv::new(db.clone(), "chunks_index"),
            chunk_data_index: RocksKv::new(db.clone(), "chunk_data_index"),
            data_root_index: RocksKv::new(db.clone(), "data_root_index"),
            data_root_offset_index: RocksKv::new(db.clone(), "data_root_offset_index"),
            tx_index: RocksKv::new(db.clone(), "tx_index"),
            tx_offset_index: RocksKv::new(db.clone(), "tx_offset_index"),
            disk_pool_chunks_index: RocksKv::new(db.clone(), "disk_pool_chunks_index"),
            missing_chunks_index: RocksKv::new(db.clone(), "missing_chunks_index"),
            migrations_index: RocksKv::new(db, "migrations_index"),
        }
    }
}

pub struct EngineState {
    pub db: Arc<DB>,
    pub tables: EngineTables,
    pub config: &'static EngineConfig,

    pub joined: bool,
    pub sync_record: IntervalSet,
    pub peer_sync_records: HashMap<Peer, IntervalSet>,
    pub disk_pool: DiskPoolState,
    pub compacted_size: u64,
    pub weave_size: u64,
    pub block_index: BlockIndex,
    pub missing_chunks: IntervalSet,
    pub disk_pool_cursor: Vec<u8>,
    pub missing_data_cursor: Vec<u8>,

    pub merkle: Arc<dyn MerkleVerify>,
    pub blacklist: Arc<dyn BlacklistClient>,
    pub peer_client: Arc<dyn PeerClient>,
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::blacklist::StaticBlacklist;
    use crate::merkle::Sha256MerkleTree;
    use async_trait::async_trait;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct NoopPeerClient;

    #[async_trait]
    impl PeerClient for NoopPeerClient {
        async fn fetch_sync_record(&self, _peer: &Peer) -> crate::types::Result<IntervalSet> {
            Ok(IntervalSet::new())
        }
        async fn fetch_chunk(&self, _peer: &Peer, _absolute_offset: u64) -> crate::types::Result<crate::peer_client::PeerChunk> {
            Err(crate::types::EngineError::ChunkNotFound)
        }
        async fn fetch_peer_list(&self, _peer: &Peer) -> crate::types::Result<Vec<Peer>> {
            Ok(Vec::new())
        }
    }

    /// A blacklist test double exposing a handle the test can mutate
    /// directly, since `EngineState.blacklist` is a trait object.
    pub struct SharedBlacklist(pub Arc<Mutex<StaticBlacklist>>);

    #[async_trait]
    impl BlacklistClient for SharedBlacklist {
        fn is_byte_blacklisted(&self, offset: u64) -> bool {
            self.0.lock().unwrap().is_byte_blacklisted(offset)
        }
        async fn notify_about_removed_tx_data(&self, tx_id: &[u8; 32]) -> crate::types::Result<()> {
            self.0.lock().unwrap().notify_about_removed_tx_data_sync(tx_id)
        }
    }

    impl StaticBlacklist {
        pub fn notify_about_removed_tx_data_sync(&self, _tx_id: &[u8; 32]) -> crate::types::Result<()> {
            Ok(())
        }
    }

    static CONFIG: once_cell::sync::Lazy<EngineConfig> = once_cell::sync::Lazy::new(|| EngineConfig {
        paths: crate::config::PathsConfig {
            db_path: "unused".to_string(),
            legacy_chunks_dir: "unused".to_string(),
        },
        disk_pool: crate::config::DiskPoolConfigWithDefaults::default(),
        peers: crate::config::PeersConfig::default(),
    });

    pub fn test_state() -> (EngineState, Arc<DB>) {
        let (state, db, _bl) = test_state_with_blacklist();
        (state, db)
    }

    pub fn test_state_with_blacklist() -> (EngineState, Arc<DB>, Arc<Mutex<StaticBlacklist>>) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let mut descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        for cf in crate::constants::COLUMN_FAMILIES {
            descriptors.push(ColumnFamilyDescriptor::new(cf, Options::default()));
        }
        let db = Arc::new(DB::open_cf_descriptors(&opts, dir.path(), descriptors).unwrap());
        let blacklist = Arc::new(Mutex::new(StaticBlacklist::new()));

        let state = EngineState {
            db: db.clone(),
            tables: EngineTables::new(db.clone()),
            config: &CONFIG,
            joined: true,
            sync_record: IntervalSet::new(),
            peer_sync_records: HashMap::new(),
            disk_pool: DiskPoolState::new(
                CONFIG.max_disk_pool_buffer_bytes(),
                CONFIG.max_disk_pool_data_root_buffer_bytes(),
            ),
            compacted_size: 0,
            weave_size: 0,
            block_index: BlockIndex::new(),
            missing_chunks: IntervalSet::new(),
            disk_pool_cursor: Vec::new(),
            missing_data_cursor: Vec::new(),
            merkle: Arc::new(Sha256MerkleTree),
            blacklist: Arc::new(SharedBlacklist(blacklist.clone())),
            peer_client: Arc::new(NoopPeerClient),
        };
        // `dir` would otherwise delete the RocksDB directory out from under
        // `db` when dropped at the end of this function; tests only need
        // the open `Arc<DB>`, so the guard is leaked for the process
        // lifetime rather than threaded through every call site.
        std::mem::forget(dir);
        (state, db, blacklist)
    }
}
