/// Content-blacklist collaborator: checking whether a byte offset is
/// blacklisted, notifying the service when a tx's data has been erased, and
/// the line-oriented parser for blacklist source files (§6).
use async_trait::async_trait;

use crate::types::{Hash32, Result};

#[async_trait]
pub trait BlacklistClient: Send + Sync {
    fn is_byte_blacklisted(&self, offset: u64) -> bool;
    async fn notify_about_removed_tx_data(&self, tx_id: &Hash32) -> Result<()>;
}

/// Simple in-memory blacklist keyed by offset range, good enough to ground
/// `store_chunk`'s blacklist check and the removal-notification path without
/// depending on an external service during tests.
pub struct StaticBlacklist {
    blacklisted_offsets: std::collections::BTreeSet<u64>,
}

impl StaticBlacklist {
    pub fn new() -> Self {
        Self {
            blacklisted_offsets: std::collections::BTreeSet::new(),
        }
    }

    pub fn blacklist_offset(&mut self, offset: u64) {
        self.blacklisted_offsets.insert(offset);
    }
}

impl Default for StaticBlacklist {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlacklistClient for StaticBlacklist {
    fn is_byte_blacklisted(&self, offset: u64) -> bool {
        self.blacklisted_offsets.contains(&offset)
    }

    async fn notify_about_removed_tx_data(&self, _tx_id: &Hash32) -> Result<()> {
        Ok(())
    }
}

/// Parses a byte stream of line-separated base64url-encoded 32-byte tx-ids.
/// Accepts CR/LF/CRLF line endings; invalid lines are skipped (with the
/// caller expected to log a warning per line); an empty file yields an empty
/// list rather than an error.
pub fn parse_blacklist_file(bytes: &[u8]) -> Vec<Hash32> {
    use base64::Engine;
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for line in text.split(['\n']) {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(line) {
            Ok(decoded) if decoded.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&decoded);
                out.push(hash);
            }
            _ => {
                tracing::warn!(line = %line, "skipping invalid blacklist line");
            }
        }
    }
    out
}
