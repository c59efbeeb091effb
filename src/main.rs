mod batch;
mod blacklist;
mod block_index;
mod config;
mod constants;
mod db_handles;
mod disk_pool;
mod disk_space;
mod engine;
mod interval_set;
mod keys;
mod kv;
mod merkle;
mod metrics;
mod model;
mod peer_client;
mod persistence;
mod proof;
mod registry;
mod sync_record;
mod telemetry;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::blacklist::StaticBlacklist;
use crate::block_index::BlockIndex;
use crate::config::{get_global_config, init_global_config};
use crate::constants::{
    COLUMN_FAMILIES, CONSULT_PEER_RECORDS_COUNT, DISK_POOL_SCAN_FREQUENCY_MS,
    DISK_SPACE_CHECK_FREQUENCY_MS, PEER_SYNC_RECORDS_FREQUENCY_MS,
    PERSIST_SYNC_STATE_FREQUENCY_MS, PICK_PEERS_OUT_OF_RANDOM_N,
    REMOVE_EXPIRED_DATA_ROOTS_FREQUENCY_MS,
};
use crate::db_handles::DbHandles;
use crate::disk_pool::DiskPoolState;
use crate::engine::state::{EngineState, EngineTables};
use crate::interval_set::IntervalSet;
use crate::merkle::Sha256MerkleTree;
use crate::peer_client::HttpPeerClient;
use crate::registry::TableRegistry;
use crate::telemetry::{init_tracing, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(TelemetryConfig::default())?;
    init_global_config()?;
    let config = get_global_config();
    metrics::init_metrics().ok();

    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)?;

    let mut db_options = Options::default();
    db_options.create_if_missing(true);
    db_options.create_missing_column_families(true);
    db_options.set_write_buffer_size(256 * 1024 * 1024);
    db_options.set_max_write_buffer_number(4);
    db_options.set_min_write_buffer_number_to_merge(2);
    db_options.set_target_file_size_base(640 * 1024 * 1024);
    db_options.set_level_zero_file_num_compaction_trigger(8);
    db_options.set_max_background_jobs(8);
    db_options.set_compression_type(rocksdb::DBCompressionType::Lz4);
    db_options.increase_parallelism(8);

    let mut cf_descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
    for cf in COLUMN_FAMILIES {
        let mut cf_opts = Options::default();
        // offset-keyed tables benefit from a small prefix bloom filter;
        // hash-keyed tables key off the full 32-byte digest.
        cf_opts.set_target_file_size_base(640 * 1024 * 1024);
        cf_descriptors.push(ColumnFamilyDescriptor::new(cf.to_string(), cf_opts));
    }

    let db = Arc::new(DB::open_cf_descriptors(&db_options, &db_path, cf_descriptors)?);
    let handles = DbHandles::new(db.clone()).map_err(|e| format!("startup validation failed: {}", e))?;
    registry::publish(TableRegistry::from_handles(&handles));

    let sync_state_path = db_path.join(persistence::SYNC_STATE_FILE);
    let persisted = persistence::load(&sync_state_path)?;

    let (sync_record, block_index, disk_pool_data_roots, disk_pool_size, compacted_size) = match persisted {
        Some(p) => (p.sync_record, p.block_index, p.disk_pool_data_roots, p.disk_pool_size, p.compacted_size),
        None => (IntervalSet::new(), BlockIndex::new(), Vec::new(), 0, 0),
    };

    let mut disk_pool_state = DiskPoolState::new(
        config.max_disk_pool_buffer_bytes(),
        config.max_disk_pool_data_root_buffer_bytes(),
    );
    for (key, entry) in disk_pool_data_roots {
        disk_pool_state.data_roots.insert(key, entry);
    }
    disk_pool_state.disk_pool_size = disk_pool_size;

    let weave_size = block_index.weave_size();
    let joined = !block_index.is_empty();

    let state = EngineState {
        db: db.clone(),
        tables: EngineTables::new(db.clone()),
        config,
        joined,
        sync_record,
        peer_sync_records: Default::default(),
        disk_pool: disk_pool_state,
        compacted_size,
        weave_size,
        block_index,
        missing_chunks: IntervalSet::new(),
        disk_pool_cursor: Vec::new(),
        missing_data_cursor: Vec::new(),
        merkle: Arc::new(Sha256MerkleTree),
        blacklist: Arc::new(StaticBlacklist::new()),
        peer_client: Arc::new(HttpPeerClient::new(Duration::from_secs(30))),
    };

    let handle = engine::spawn(state);

    // §4.9 migration: drains the legacy file-per-hash chunk store into
    // `chunk_data_index` in the background, retrying forever on error.
    let legacy_dir = PathBuf::from(&config.paths.legacy_chunks_dir);
    tokio::spawn(engine::migration::run_in_background(db.clone(), legacy_dir));

    spawn_timers(handle.clone(), config);

    tracing::info!("weavesync engine started, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    handle.persist_state();
    // give the actor a moment to flush the sidecar file before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Spawns the background timer loops that drive the engine absent any
/// externally-triggered activity (§4.4, §4.5, §4.6's periodic persistence).
fn spawn_timers(handle: engine::EngineHandle, config: &'static crate::config::EngineConfig) {
    // `check_space_sync_random_interval` timer (§4.4).
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(DISK_SPACE_CHECK_FREQUENCY_MS));
            loop {
                ticker.tick().await;
                handle.check_space_sync_random_interval();
            }
        });
    }

    // Disk-pool processor idle timer (§4.5): kicks the cyclic walk every
    // `DISK_POOL_SCAN_FREQUENCY_MS`; the handler re-casts itself immediately
    // while it keeps making progress, falling idle until the next tick.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(DISK_POOL_SCAN_FREQUENCY_MS));
            loop {
                ticker.tick().await;
                handle.process_disk_pool();
            }
        });
    }

    // Disk-pool expiration sweep (§4.5 `update_disk_pool_data_roots`).
    {
        let handle = handle.clone();
        let expiration_us = config.disk_pool.disk_pool_data_root_expiration_time_us as u128;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(REMOVE_EXPIRED_DATA_ROOTS_FREQUENCY_MS));
            loop {
                ticker.tick().await;
                handle.update_disk_pool_expiry(now_micros(), expiration_us);
            }
        });
    }

    // Peer sync-record refresh (§4.4 tie-breaks): samples up to
    // `PICK_PEERS_OUT_OF_RANDOM_N` bootstrap peers, fetches their sync
    // records, and keeps a `CONSULT_PEER_RECORDS_COUNT` subset for the
    // scheduler to pick from.
    {
        let peers = config.peers.bootstrap.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let client = HttpPeerClient::new(Duration::from_secs(10));
            let mut ticker = tokio::time::interval(Duration::from_millis(PEER_SYNC_RECORDS_FREQUENCY_MS));
            loop {
                ticker.tick().await;
                refresh_peer_records(&client, &peers, &handle).await;
            }
        });
    }

    // Sidecar sync-state persistence (§4.6, §6): rewrites the term file
    // often enough that a crash loses at most one interval.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(PERSIST_SYNC_STATE_FREQUENCY_MS));
            loop {
                ticker.tick().await;
                handle.persist_state();
            }
        });
    }
}

async fn refresh_peer_records(client: &HttpPeerClient, peers: &[String], handle: &engine::EngineHandle) {
    use crate::peer_client::PeerClient;
    use rand::seq::SliceRandom;

    let mut sample: Vec<&String> = peers.iter().collect();
    sample.shuffle(&mut rand::thread_rng());
    sample.truncate(PICK_PEERS_OUT_OF_RANDOM_N);

    let mut fetched = Vec::new();
    for peer in sample {
        match client.fetch_sync_record(peer).await {
            Ok(record) => {
                tracing::debug!(peer = %peer, intervals = record.count(), "refreshed peer sync record");
                fetched.push((peer.clone(), record));
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "peer sync record refresh failed");
            }
        }
    }
    fetched.truncate(CONSULT_PEER_RECORDS_COUNT);
    if !fetched.is_empty() {
        handle.update_peer_sync_records(fetched);
    }
}

fn now_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}
