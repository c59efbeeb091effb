/// Metrics Module - Prometheus Instrumentation
///
/// Mirrors the teacher's pattern: a single `Registry`, one `lazy_static!`
/// block of typed metric handles, a `init_metrics` that registers them all,
/// and a `gather_metrics` that text-encodes the registry for scraping.
/// Recording calls live next to the code paths they describe; emitting the
/// encoded text over HTTP is outside this crate's scope (no serving layer
/// is specified), but the registry and recording calls are in scope as
/// ambient plumbing.
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // --- chunk store ---------------------------------------------------
    pub static ref CHUNKS_STORED: IntCounterVec = IntCounterVec::new(
        Opts::new("weavesync_chunks_stored_total", "Chunks stored by source"),
        &["source"] // "add_chunk", "sync", "disk_pool_promotion"
    ).unwrap();

    pub static ref CHUNK_STORE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("weavesync_chunk_store_duration_seconds", "store_chunk latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref WEAVE_SIZE_BYTES: IntGauge = IntGauge::new(
        "weavesync_weave_size_bytes", "Current weave size"
    ).unwrap();

    // --- sync record / scheduler ----------------------------------------
    pub static ref SYNC_RECORD_INTERVAL_COUNT: IntGauge = IntGauge::new(
        "weavesync_sync_record_interval_count", "Number of intervals in the sync record"
    ).unwrap();

    pub static ref SYNC_RECORD_BYTES: IntGauge = IntGauge::new(
        "weavesync_sync_record_bytes", "Total bytes covered by the sync record"
    ).unwrap();

    pub static ref BYTES_SYNCED: IntCounter = IntCounter::new(
        "weavesync_bytes_synced_total", "Bytes fetched from peers and persisted"
    ).unwrap();

    pub static ref SYNC_PEER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("weavesync_sync_peer_errors_total", "Peer fetch errors by peer"),
        &["peer"]
    ).unwrap();

    pub static ref PEER_FETCH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("weavesync_peer_fetch_duration_seconds", "Peer chunk fetch latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["peer"]
    ).unwrap();

    // --- disk pool --------------------------------------------------------
    pub static ref DISK_POOL_SIZE_BYTES: IntGauge = IntGauge::new(
        "weavesync_disk_pool_size_bytes", "Bytes currently staged in the disk pool"
    ).unwrap();

    pub static ref DISK_POOL_ROOTS_EXPIRED: IntCounter = IntCounter::new(
        "weavesync_disk_pool_roots_expired_total", "Data roots expired from the disk pool without confirmation"
    ).unwrap();

    pub static ref DISK_POOL_ROOTS_PROMOTED: IntCounter = IntCounter::new(
        "weavesync_disk_pool_roots_promoted_total", "Data roots promoted from the disk pool into the main indices"
    ).unwrap();

    // --- compaction / missing chunks ---------------------------------------
    pub static ref COMPACTION_EVENTS: IntCounter = IntCounter::new(
        "weavesync_compaction_events_total", "compact_intervals invocations"
    ).unwrap();

    pub static ref COMPACTED_SIZE_BYTES: IntGauge = IntGauge::new(
        "weavesync_compacted_size_bytes", "Total span of intervals merged away but still desired"
    ).unwrap();

    // --- reorg --------------------------------------------------------------
    pub static ref REORG_EVENTS: IntCounter = IntCounter::new(
        "weavesync_reorg_events_total", "Reorg rollbacks applied"
    ).unwrap();

    pub static ref REORG_DEPTH_BYTES: IntGauge = IntGauge::new(
        "weavesync_reorg_depth_bytes", "Span of the weave rolled back by the most recent reorg"
    ).unwrap();

    // --- blacklist ------------------------------------------------------------
    pub static ref BLACKLIST_CHUNKS_ERASED: IntCounter = IntCounter::new(
        "weavesync_blacklist_chunks_erased_total", "Chunks erased by request_tx_data_removal"
    ).unwrap();

    // --- migration -------------------------------------------------------------
    pub static ref MIGRATION_PROGRESS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("weavesync_migration_progress", "Migration cursor progress by migration name"),
        &["migration"]
    ).unwrap();

    // --- errors --------------------------------------------------------------
    pub static ref STORAGE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("weavesync_storage_errors_total", "KV errors by table"),
        &["table"]
    ).unwrap();
}

pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(CHUNKS_STORED.clone()))?;
    REGISTRY.register(Box::new(CHUNK_STORE_DURATION.clone()))?;
    REGISTRY.register(Box::new(WEAVE_SIZE_BYTES.clone()))?;

    REGISTRY.register(Box::new(SYNC_RECORD_INTERVAL_COUNT.clone()))?;
    REGISTRY.register(Box::new(SYNC_RECORD_BYTES.clone()))?;
    REGISTRY.register(Box::new(BYTES_SYNCED.clone()))?;
    REGISTRY.register(Box::new(SYNC_PEER_ERRORS.clone()))?;
    REGISTRY.register(Box::new(PEER_FETCH_DURATION.clone()))?;

    REGISTRY.register(Box::new(DISK_POOL_SIZE_BYTES.clone()))?;
    REGISTRY.register(Box::new(DISK_POOL_ROOTS_EXPIRED.clone()))?;
    REGISTRY.register(Box::new(DISK_POOL_ROOTS_PROMOTED.clone()))?;

    REGISTRY.register(Box::new(COMPACTION_EVENTS.clone()))?;
    REGISTRY.register(Box::new(COMPACTED_SIZE_BYTES.clone()))?;

    REGISTRY.register(Box::new(REORG_EVENTS.clone()))?;
    REGISTRY.register(Box::new(REORG_DEPTH_BYTES.clone()))?;

    REGISTRY.register(Box::new(BLACKLIST_CHUNKS_ERASED.clone()))?;

    REGISTRY.register(Box::new(MIGRATION_PROGRESS.clone()))?;

    REGISTRY.register(Box::new(STORAGE_ERRORS.clone()))?;

    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Small latency-measurement helper, matching the teacher's `Timer`.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn observe(self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_does_not_panic() {
        // REGISTRY is process-global and lazily initialized; registering
        // twice across test runs in the same process would error, so this
        // test only checks the first call succeeds or the error is
        // "already registered" (harmless under `cargo test`'s shared binary).
        let _ = init_metrics();
    }

    #[test]
    fn gather_metrics_contains_known_series() {
        let _ = init_metrics();
        CHUNKS_STORED.with_label_values(&["test"]).inc();
        let out = gather_metrics();
        assert!(out.contains("weavesync_chunks_stored_total"));
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.004);
    }
}
