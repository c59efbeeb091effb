/// Weave and Chunk Size Constants
///
/// These constants mirror the fixed bounds the sync engine uses to size
/// chunks, buffers, and timers. All offset/size logic should use these
/// instead of magic numbers.

/// Largest a single chunk's body may be, in bytes.
pub const MAX_CHUNK_BYTES: u64 = 262_144;

/// Largest number of sync-record intervals we will ever hand to a peer or
/// persist verbatim; beyond this the record is compacted (see `compaction`).
pub const MAX_SHARED_SYNCED_INTERVALS_COUNT: usize = 10_000;

/// Extra slack above `MAX_SHARED_SYNCED_INTERVALS_COUNT` allowed to
/// accumulate before a compaction pass is triggered, so compaction runs in
/// batches rather than on every single insert.
pub const EXTRA_INTERVALS_BEFORE_COMPACTION: usize = 100;

/// How often the idle-space timer fires to check free disk space and kick
/// off a new random sync attempt, in milliseconds.
pub const DISK_SPACE_CHECK_FREQUENCY_MS: u64 = 5_000;

/// How often we refresh the locally cached sample of peer sync records.
pub const PEER_SYNC_RECORDS_FREQUENCY_MS: u64 = 120_000;

/// Number of peers whose sync records we keep refreshed at any one time.
pub const CONSULT_PEER_RECORDS_COUNT: usize = 10;

/// Size of the random pool of candidate peers we sample
/// `CONSULT_PEER_RECORDS_COUNT` from.
pub const PICK_PEERS_OUT_OF_RANDOM_N: usize = 50;

/// How often the disk-pool processor ticks when it has nothing left to do.
pub const DISK_POOL_SCAN_FREQUENCY_MS: u64 = 2_000;

/// How often stale `disk_pool_data_roots` entries are swept away.
pub const REMOVE_EXPIRED_DATA_ROOTS_FREQUENCY_MS: u64 = 10_000;

/// How often the sidecar sync-state term file is rewritten to disk.
pub const PERSIST_SYNC_STATE_FREQUENCY_MS: u64 = 30_000;

/// Delay before a failed migration step is retried.
pub const MIGRATION_RETRY_DELAY_MS: u64 = 30_000;

/// Free-space floor below which sync pauses and new chunk writes (unless
/// explicitly opted past it) are refused.
pub const DISK_DATA_BUFFER_SIZE: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB

/// Number of most-recent blocks kept in the in-memory `block_index`.
pub const TRACK_CONFIRMATIONS: usize = 50;

/// Largest transaction body the read path will assemble in one call to
/// `get_tx_data`.
pub const MAX_SERVED_TX_DATA_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB

/// Step used when picking the first probe byte inside a fresh missing
/// interval: `MAX_CHUNK_BYTES / 8`.
pub const MISSING_PROBE_STEP: u64 = MAX_CHUNK_BYTES / 8;

/// Minimum attractiveness ratio `chunk_size / (1 + len(data_path))` below
/// which a freshly fetched chunk is considered not worth the peer's
/// authentication overhead, and the peer is dropped for the remainder of
/// the current sync attempt.
pub const MIN_CHUNK_ATTRACTIVENESS_RATIO: f64 = 256.0;

/// The nine RocksDB column families the engine owns.
pub const COLUMN_FAMILIES: [&str; 9] = [
    "chunks_index",
    "chunk_data_index",
    "data_root_index",
    "data_root_offset_index",
    "tx_index",
    "tx_offset_index",
    "disk_pool_chunks_index",
    "missing_chunks_index",
    "migrations_index",
];

/// Name under which the v2 data-index migration records its progress in
/// `migrations_index`.
pub const MIGRATION_STORE_DATA_IN_V2_INDEX: &str = "store_data_in_v2_index";

/// Marker value meaning a migration has finished.
pub const MIGRATION_COMPLETE: &str = "complete";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_and_interval_bounds_are_sane() {
        assert_eq!(MAX_CHUNK_BYTES, 262_144);
        assert!(MAX_SHARED_SYNCED_INTERVALS_COUNT > 0);
        assert!(EXTRA_INTERVALS_BEFORE_COMPACTION > 0);
    }

    #[test]
    fn missing_probe_step_divides_max_chunk() {
        assert_eq!(MISSING_PROBE_STEP, MAX_CHUNK_BYTES / 8);
        assert!(MISSING_PROBE_STEP > 0);
    }

    #[test]
    fn column_families_has_nine_entries() {
        assert_eq!(COLUMN_FAMILIES.len(), 9);
    }
}
