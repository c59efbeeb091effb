/// Engine configuration, loaded from `config.toml` via the `config` crate.
///
/// Follows the teacher's `init_global_config`/`get_global_config` pattern: a
/// process-wide `OnceCell<EngineConfig>` set once at startup, with a
/// `load_config` escape hatch for standalone tools/tests that want a config
/// without touching the global.
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;
use std::path::PathBuf;

use crate::constants::*;

static GLOBAL_CONFIG: OnceCell<EngineConfig> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory the RocksDB column families live under.
    pub db_path: String,
    /// Scratch directory used by the v2-index migration's legacy
    /// file-per-hash store while it is being drained.
    #[serde(default = "default_legacy_chunks_dir")]
    pub legacy_chunks_dir: String,
}

fn default_legacy_chunks_dir() -> String {
    "legacy_chunks".to_string()
}

fn default_max_disk_pool_buffer_mb() -> u64 {
    2_000
}
fn default_max_disk_pool_data_root_buffer_mb() -> u64 {
    500
}
fn default_disk_pool_data_root_expiration_time_us() -> u64 {
    // 2 hours
    2 * 60 * 60 * 1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeersConfig {
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub disk_pool: DiskPoolConfigWithDefaults,
    #[serde(default)]
    pub peers: PeersConfig,
}

// `config::Config` can't derive `Default` on nested required structs, so the
// disk-pool knobs get their own always-valid wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskPoolConfigWithDefaults {
    #[serde(default = "default_max_disk_pool_buffer_mb")]
    pub max_disk_pool_buffer_mb: u64,
    #[serde(default = "default_max_disk_pool_data_root_buffer_mb")]
    pub max_disk_pool_data_root_buffer_mb: u64,
    #[serde(default = "default_disk_pool_data_root_expiration_time_us")]
    pub disk_pool_data_root_expiration_time_us: u64,
}

impl Default for DiskPoolConfigWithDefaults {
    fn default() -> Self {
        Self {
            max_disk_pool_buffer_mb: default_max_disk_pool_buffer_mb(),
            max_disk_pool_data_root_buffer_mb: default_max_disk_pool_data_root_buffer_mb(),
            disk_pool_data_root_expiration_time_us: default_disk_pool_data_root_expiration_time_us(
            ),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.db_path)
    }

    pub fn max_disk_pool_buffer_bytes(&self) -> u64 {
        self.disk_pool.max_disk_pool_buffer_mb * 1024 * 1024
    }

    pub fn max_disk_pool_data_root_buffer_bytes(&self) -> u64 {
        self.disk_pool.max_disk_pool_data_root_buffer_mb * 1024 * 1024
    }

    /// Disk-space floor below which sync pauses; currently a fixed constant
    /// but exposed as a method so it can become configurable without
    /// touching call sites.
    pub fn disk_data_buffer_size(&self) -> u64 {
        DISK_DATA_BUFFER_SIZE
    }
}

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let cfg = load_config()?;
    GLOBAL_CONFIG
        .set(cfg)
        .map_err(|_| "config already initialized")?;
    Ok(())
}

pub fn get_global_config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/tests without touching the global.
pub fn load_config() -> Result<EngineConfig, Box<dyn Error>> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::with_prefix("WEAVESYNC").separator("__"))
        .build()?;
    raw.try_deserialize::<EngineConfig>()
        .map_err(|e| format!("invalid config.toml: {}", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_pool_defaults_are_nonzero() {
        let d = DiskPoolConfigWithDefaults::default();
        assert!(d.max_disk_pool_buffer_mb > 0);
        assert!(d.max_disk_pool_data_root_buffer_mb > 0);
        assert!(d.disk_pool_data_root_expiration_time_us > 0);
    }

    #[test]
    fn byte_conversions_scale_mb() {
        let cfg = EngineConfig {
            paths: PathsConfig {
                db_path: "/tmp/x".into(),
                legacy_chunks_dir: "legacy".into(),
            },
            disk_pool: DiskPoolConfigWithDefaults {
                max_disk_pool_buffer_mb: 10,
                max_disk_pool_data_root_buffer_mb: 1,
                disk_pool_data_root_expiration_time_us: 1,
            },
            peers: PeersConfig::default(),
        };
        assert_eq!(cfg.max_disk_pool_buffer_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.max_disk_pool_data_root_buffer_bytes(), 1024 * 1024);
    }
}
