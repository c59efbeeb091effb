/// The engine actor (§2 item 8, §4.1): a single task owning every table,
/// the sync record, the disk-pool roots map, and the current block-index
/// prefix. All mutating calls funnel through `EngineHandle`; read-only
/// lookups bypass the actor entirely and consult `crate::registry` directly.
pub mod compaction;
pub mod disk_pool_processor;
pub mod erasure;
pub mod migration;
pub mod reorg;
pub mod state;
pub mod store_chunk;
pub mod sync_scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::block_index::BlockIndexEntry;
use crate::keys::{data_root_key, decode_offset_key, hash_key, offset_key};
use crate::kv::Kv;
use crate::model::{decode, ChunkIndexEntry, DataRootEntry, TxIndexEntry};
use crate::peer_client::{Peer, PeerChunk};
use crate::proof::ChunkProof;
use crate::types::{AbsoluteOffset, EngineError, Hash32, Result};

use reorg::BlockTxs;
use state::EngineState;
use store_chunk::{store_chunk, StoreChunkParams, StoreOutcome};

pub enum SyncRecordFormat {
    Json,
    Binary,
}

pub struct AddChunkRequest {
    pub data_root: Hash32,
    pub data_path: Vec<u8>,
    pub chunk: Vec<u8>,
    pub offset_in_tx: u64,
    pub tx_size: u64,
    pub write_past_disk_limit: bool,
}

enum Command {
    Join {
        blocks: Vec<BlockTxs>,
        recent_bi: Vec<BlockIndexEntry>,
    },
    AddTipBlock {
        blocks: Vec<BlockTxs>,
        recent_bi: Vec<BlockIndexEntry>,
    },
    AddBlock {
        block: BlockTxs,
        entry: BlockIndexEntry,
    },
    AddChunk {
        req: AddChunkRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    AddDataRootToDiskPool {
        data_root: Hash32,
        tx_size: u64,
        tx_id: Hash32,
    },
    MaybeDropDataRootFromDiskPool {
        data_root: Hash32,
        tx_size: u64,
        tx_id: Hash32,
    },
    GetSyncRecord {
        format: SyncRecordFormat,
        reply: oneshot::Sender<String>,
    },
    RequestTxDataRemoval {
        tx_id: Hash32,
    },
    CompactIntervals,
    UpdateDiskPoolExpiry {
        now_us: u128,
        expiration_us: u128,
    },
    CheckSpaceSyncRandomInterval,
    SyncRandomInterval {
        excluded: Vec<Peer>,
    },
    SyncChunk {
        peer: Peer,
        left_bound: AbsoluteOffset,
        l_byte: AbsoluteOffset,
        r_byte: AbsoluteOffset,
        right_bound: AbsoluteOffset,
    },
    StoreFetchedChunk {
        peer: Peer,
        probe_byte: AbsoluteOffset,
        chunk: PeerChunk,
        window: (AbsoluteOffset, AbsoluteOffset, AbsoluteOffset, AbsoluteOffset),
    },
    ProcessDiskPool,
    UpdatePeerSyncRecords {
        records: Vec<(Peer, crate::interval_set::IntervalSet)>,
    },
    PersistState,
}

/// Cloneable front for the engine actor. Every method here serializes
/// through the actor's mailbox; read-only accessors live as free functions
/// further down instead, per §4.1's concurrency note.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub fn join(&self, blocks: Vec<BlockTxs>, recent_bi: Vec<BlockIndexEntry>) {
        let _ = self.tx.send(Command::Join { blocks, recent_bi });
    }

    pub fn add_tip_block(&self, blocks: Vec<BlockTxs>, recent_bi: Vec<BlockIndexEntry>) {
        let _ = self.tx.send(Command::AddTipBlock { blocks, recent_bi });
    }

    pub fn add_block(&self, block: BlockTxs, entry: BlockIndexEntry) {
        let _ = self.tx.send(Command::AddBlock { block, entry });
    }

    pub async fn add_chunk(&self, req: AddChunkRequest, deadline: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::AddChunk { req, reply: reply_tx })
            .map_err(|_| EngineError::Other("engine actor stopped".to_string()))?;
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Other("engine actor dropped reply".to_string())),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    pub fn add_data_root_to_disk_pool(&self, data_root: Hash32, tx_size: u64, tx_id: Hash32) {
        let _ = self.tx.send(Command::AddDataRootToDiskPool { data_root, tx_size, tx_id });
    }

    pub fn maybe_drop_data_root_from_disk_pool(&self, data_root: Hash32, tx_size: u64, tx_id: Hash32) {
        let _ = self.tx.send(Command::MaybeDropDataRootFromDiskPool { data_root, tx_size, tx_id });
    }

    pub async fn get_sync_record(&self, format: SyncRecordFormat, deadline: Duration) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::GetSyncRecord { format, reply: reply_tx })
            .map_err(|_| EngineError::Other("engine actor stopped".to_string()))?;
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(s)) => Ok(s),
            Ok(Err(_)) => Err(EngineError::Other("engine actor dropped reply".to_string())),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    pub fn request_tx_data_removal(&self, tx_id: Hash32) {
        let _ = self.tx.send(Command::RequestTxDataRemoval { tx_id });
    }

    pub fn compact_intervals(&self) {
        let _ = self.tx.send(Command::CompactIntervals);
    }

    pub fn update_disk_pool_expiry(&self, now_us: u128, expiration_us: u128) {
        let _ = self.tx.send(Command::UpdateDiskPoolExpiry { now_us, expiration_us });
    }

    pub fn check_space_sync_random_interval(&self) {
        let _ = self.tx.send(Command::CheckSpaceSyncRandomInterval);
    }

    pub fn sync_random_interval(&self, excluded: Vec<Peer>) {
        let _ = self.tx.send(Command::SyncRandomInterval { excluded });
    }

    pub fn sync_chunk(
        &self,
        peer: Peer,
        left_bound: AbsoluteOffset,
        l_byte: AbsoluteOffset,
        r_byte: AbsoluteOffset,
        right_bound: AbsoluteOffset,
    ) {
        let _ = self.tx.send(Command::SyncChunk {
            peer,
            left_bound,
            l_byte,
            r_byte,
            right_bound,
        });
    }

    pub fn store_fetched_chunk(
        &self,
        peer: Peer,
        probe_byte: AbsoluteOffset,
        chunk: PeerChunk,
        window: (AbsoluteOffset, AbsoluteOffset, AbsoluteOffset, AbsoluteOffset),
    ) {
        let _ = self.tx.send(Command::StoreFetchedChunk {
            peer,
            probe_byte,
            chunk,
            window,
        });
    }

    /// Drives one step of the disk-pool processor (§4.5). Callers (the idle
    /// timer, or the handler itself when a step made progress) re-cast this
    /// to keep the cyclic walk moving without blocking other engine work.
    pub fn process_disk_pool(&self) {
        let _ = self.tx.send(Command::ProcessDiskPool);
    }

    /// Replaces the locally cached sample of peer sync records (§4.4 tie-
    /// breaks): refreshed every `PEER_SYNC_RECORDS_FREQUENCY_MS` with up to
    /// `CONSULT_PEER_RECORDS_COUNT` freshly fetched peers.
    pub fn update_peer_sync_records(&self, records: Vec<(Peer, crate::interval_set::IntervalSet)>) {
        let _ = self.tx.send(Command::UpdatePeerSyncRecords { records });
    }

    /// Writes the sidecar sync-state term file (§4.6, §6). Cast so the
    /// periodic persistence timer never blocks on engine throughput; errors
    /// are logged by the handler rather than surfaced to the caller.
    pub fn persist_state(&self) {
        let _ = self.tx.send(Command::PersistState);
    }
}

#[cfg(test)]
impl EngineHandle {
    /// A handle with no actor behind it: casts land in a channel nothing
    /// drains. Good enough for unit tests that only check synchronous
    /// state mutations and don't care whether a re-cast was sent.
    pub fn test_handle() -> EngineHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        EngineHandle { tx }
    }
}

/// Spawns the engine actor task and returns a handle to it.
pub fn spawn(mut state: EngineState) -> EngineHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let handle = EngineHandle { tx };
    let handle_for_actor = handle.clone();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = handle_command(&mut state, &handle_for_actor, cmd).await {
                tracing::error!(error = %e, "engine command failed");
            }
        }
    });
    handle
}

async fn handle_command(state: &mut EngineState, handle: &EngineHandle, cmd: Command) -> Result<()> {
    match cmd {
        Command::Join { blocks, recent_bi } => {
            reorg::join(state, blocks, recent_bi)?;
            persist_now(state);
            Ok(())
        }
        Command::AddTipBlock { blocks, recent_bi } => {
            reorg::add_tip_block(state, blocks, recent_bi)?;
            persist_now(state);
            Ok(())
        }
        Command::AddBlock { block, entry } => {
            reorg::add_block(state, block, entry)?;
            persist_now(state);
            Ok(())
        }
        Command::AddChunk { req, reply } => {
            let result = handle_add_chunk(state, handle, req);
            let _ = reply.send(result);
            Ok(())
        }
        Command::AddDataRootToDiskPool { data_root, tx_size, tx_id } => {
            if !state.joined {
                return Err(EngineError::NotJoined);
            }
            let key = data_root_key(&data_root, tx_size);
            state.disk_pool.mark_pending(key, tx_id, now_micros());
            Ok(())
        }
        Command::MaybeDropDataRootFromDiskPool { data_root, tx_size, tx_id } => {
            let key = data_root_key(&data_root, tx_size);
            state.disk_pool.maybe_drop_tx(&key, &tx_id);
            Ok(())
        }
        Command::GetSyncRecord { format, reply } => {
            let encoded = match format {
                SyncRecordFormat::Json => crate::sync_record::to_json(&state.sync_record)
                    .map_err(|e| EngineError::Other(e.to_string()))?,
                SyncRecordFormat::Binary => {
                    let bytes = crate::sync_record::to_binary_terms(&state.sync_record);
                    hex::encode(bytes)
                }
            };
            let _ = reply.send(encoded);
            Ok(())
        }
        Command::RequestTxDataRemoval { tx_id } => erasure::request_tx_data_removal(state, &tx_id).await,
        Command::CompactIntervals => compaction::compact_intervals(state),
        Command::UpdateDiskPoolExpiry { now_us, expiration_us } => {
            state.disk_pool.expire(now_us, expiration_us);
            Ok(())
        }
        Command::CheckSpaceSyncRandomInterval => {
            sync_scheduler::check_space_sync_random_interval(state, handle);
            Ok(())
        }
        Command::SyncRandomInterval { excluded } => {
            sync_scheduler::sync_random_interval(state, handle, &excluded);
            Ok(())
        }
        Command::SyncChunk {
            peer,
            left_bound,
            l_byte,
            r_byte,
            right_bound,
        } => {
            sync_scheduler::sync_chunk(state, handle, peer, left_bound, l_byte, r_byte, right_bound);
            Ok(())
        }
        Command::StoreFetchedChunk {
            peer,
            probe_byte,
            chunk,
            window,
        } => sync_scheduler::store_fetched_chunk(state, handle, peer, probe_byte, chunk, window),
        Command::ProcessDiskPool => {
            if disk_pool_processor::step(state, handle)? == disk_pool_processor::StepOutcome::MadeProgress {
                handle.process_disk_pool();
            }
            Ok(())
        }
        Command::UpdatePeerSyncRecords { records } => {
            state.peer_sync_records = records.into_iter().collect();
            Ok(())
        }
        Command::PersistState => {
            persist_now(state);
            Ok(())
        }
    }
}

/// Rewrites the sidecar sync-state term file from the engine's current
/// in-memory state. Errors are logged, not propagated: a failed write
/// shouldn't interrupt engine processing, only delay durability.
fn persist_now(state: &EngineState) {
    let path = state.config.db_path().join(crate::persistence::SYNC_STATE_FILE);
    let persisted = crate::persistence::PersistedState {
        sync_record: state.sync_record.clone(),
        block_index: state.block_index.clone(),
        disk_pool_data_roots: state
            .disk_pool
            .data_roots
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        disk_pool_size: state.disk_pool.disk_pool_size,
        compacted_size: state.compacted_size,
    };
    if let Err(e) = crate::persistence::save(&path, &persisted) {
        tracing::error!(error = %e, "failed to persist sync state");
    }
}

fn now_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// `add_chunk` (§4.2): routes a submitted chunk either into the disk pool
/// (root still pending confirmation) or through every known placement via
/// the store-chunk primitive (root already confirmed).
fn handle_add_chunk(state: &mut EngineState, handle: &EngineHandle, req: AddChunkRequest) -> Result<()> {
    if !state.joined {
        return Err(EngineError::NotJoined);
    }
    if !req.write_past_disk_limit {
        let free = crate::disk_space::free_bytes(&state.config.db_path());
        if free < state.config.disk_data_buffer_size() {
            return Err(EngineError::DiskFull);
        }
    }

    let key = data_root_key(&req.data_root, req.tx_size);
    let known_root = state.tables.data_root_index.get(&key)?;
    let data_path_hash: Hash32 = sha256(&req.data_path);

    match known_root {
        None => {
            if !state.disk_pool.contains(&key) {
                return Err(EngineError::DataRootNotFound);
            }
            state
                .disk_pool
                .check_admission(&key, req.chunk.len() as u64)
                .map_err(|_| EngineError::ExceedsDiskPoolSizeLimit)?;

            let validated = validate_data_path_only(state, &req, &data_path_hash)?;
            let _ = validated;

            if state
                .tables
                .disk_pool_chunks_index
                .get(&crate::keys::disk_pool_key(
                    state.disk_pool.data_roots.get(&key).map(|e| e.first_seen_ts_us).unwrap_or(0),
                    &data_path_hash,
                ))?
                .is_some()
            {
                return Ok(()); // idempotent
            }

            let mut batch = crate::batch::AtomicBatch::new(state.db.clone());
            let ts = state.disk_pool.data_roots.get(&key).map(|e| e.first_seen_ts_us).unwrap_or_else(now_micros);
            batch.put(
                "disk_pool_chunks_index",
                crate::keys::disk_pool_key(ts, &data_path_hash),
                crate::model::encode(&crate::model::DiskPoolChunkEntry {
                    chunk_offset_in_tx: req.offset_in_tx,
                    chunk_size: req.chunk.len() as u64,
                    data_root: req.data_root,
                    tx_size: req.tx_size,
                })?,
            );
            batch.put(
                "chunk_data_index",
                hash_key(&data_path_hash),
                crate::model::encode(&crate::model::ChunkDataEntry {
                    chunk_bytes: req.chunk.clone(),
                    data_path_bytes: req.data_path.clone(),
                })?,
            );
            batch.commit()?;
            state.disk_pool.record_bytes(&key, req.chunk.len() as u64);
            Ok(())
        }
        Some(raw) => {
            let entry: DataRootEntry = decode(&raw)?;
            for (tx_root, starts) in &entry.placements {
                for (abs_tx_start, tx_path) in starts {
                    let abs_end = abs_tx_start + req.offset_in_tx;
                    let mut batch = crate::batch::AtomicBatch::new(state.db.clone());
                    let outcome = store_chunk(
                        state,
                        &mut batch,
                        StoreChunkParams {
                            abs_offset: abs_end,
                            chunk_offset_in_tx: req.offset_in_tx,
                            data_path_hash,
                            tx_root: *tx_root,
                            data_root: req.data_root,
                            tx_path: tx_path.clone(),
                            chunk_size: req.chunk.len() as u64,
                            chunk_bytes: Some(req.chunk.clone()),
                            data_path_bytes: req.data_path.clone(),
                            data_root_key: key.clone(),
                            index_only: false,
                            source: "add_chunk",
                        },
                    )?;
                    batch.commit()?;
                    if let StoreOutcome::Stored { should_compact: true } = outcome {
                        handle.compact_intervals();
                    }
                }
            }
            Ok(())
        }
    }
}

fn validate_data_path_only(state: &EngineState, req: &AddChunkRequest, data_path_hash: &Hash32) -> Result<()> {
    // Without a known tx placement yet, only the chunk-to-data-root half of
    // the proof can be checked; the tx-root half is validated later, once
    // the root is confirmed and store-chunk runs for a real placement.
    let result = state
        .merkle
        .validate_path(&req.data_root, req.offset_in_tx, req.tx_size, &req.data_path);
    match result {
        Some(r) if r.end - r.start == req.chunk.len() as u64 => {
            let _ = data_path_hash;
            Ok(())
        }
        _ => Err(EngineError::InvalidProof),
    }
}

fn sha256(bytes: &[u8]) -> Hash32 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// --- read-only lookups: never touch the engine mailbox (§4.1) --------------

pub fn get_chunk(registry: &crate::registry::TableRegistry, abs_offset: u64) -> Result<ChunkProof> {
    let key = offset_key(abs_offset);
    let raw = registry
        .chunks_index
        .get(&key)?
        .ok_or(EngineError::NotFound)?;
    let entry: ChunkIndexEntry = decode(&raw)?;
    let data = registry
        .chunk_data_index
        .get(&hash_key(&entry.data_path_hash))?
        .ok_or(EngineError::FailedToReadChunk)?;
    let data_entry: crate::model::ChunkDataEntry = decode(&data)?;
    Ok(ChunkProof::from_parts(
        &data_entry.chunk_bytes,
        &data_entry.data_path_bytes,
        &entry.data_root,
        &entry,
        abs_offset,
        true,
    ))
}

pub fn get_tx_root(registry: &crate::registry::TableRegistry, abs_offset: u64) -> Result<Hash32> {
    let key = offset_key(abs_offset);
    let raw = registry.chunks_index.get(&key)?.ok_or(EngineError::NotFound)?;
    let entry: ChunkIndexEntry = decode(&raw)?;
    Ok(entry.tx_root)
}

pub fn get_tx_offset(registry: &crate::registry::TableRegistry, tx_id: &Hash32) -> Result<u64> {
    let raw = registry.tx_index.get(tx_id)?.ok_or(EngineError::NotFound)?;
    let entry: TxIndexEntry = decode(&raw)?;
    Ok(entry.abs_tx_end_offset - entry.tx_size)
}

pub fn get_tx_data(registry: &crate::registry::TableRegistry, tx_id: &Hash32, max_served_bytes: u64) -> Result<Vec<u8>> {
    let raw = registry.tx_index.get(tx_id)?.ok_or(EngineError::NotFound)?;
    let entry: TxIndexEntry = decode(&raw)?;
    if entry.tx_size > max_served_bytes {
        return Err(EngineError::TxDataTooBig);
    }
    let tx_start = entry.abs_tx_end_offset - entry.tx_size;

    let mut out = Vec::with_capacity(entry.tx_size as usize);
    let mut cursor = offset_key(tx_start + 1);
    loop {
        let Some((key, value)) = registry.chunks_index.get_next(&cursor)? else {
            return Err(EngineError::FailedToGetTxData);
        };
        let Some(offset) = decode_offset_key(&key) else {
            return Err(EngineError::FailedToGetTxData);
        };
        if offset > entry.abs_tx_end_offset {
            return Err(EngineError::FailedToGetTxData);
        }
        let chunk_entry: ChunkIndexEntry = decode(&value)?;
        let data = registry
            .chunk_data_index
            .get(&hash_key(&chunk_entry.data_path_hash))?
            .ok_or(EngineError::FailedToReadChunk)?;
        let data_entry: crate::model::ChunkDataEntry = decode(&data)?;
        out.extend_from_slice(&data_entry.chunk_bytes);
        if offset == entry.abs_tx_end_offset {
            break;
        }
        cursor = offset_key(offset + 1);
    }
    Ok(out)
}
