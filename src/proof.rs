/// Chunk proof JSON boundary type (§6) — the shape handed to the HTTP
/// serving layer above this crate. Every binary field is base64url; the
/// size/offset fields are decimal strings so they survive JSON's float
/// precision limits untouched.
use serde::{Deserialize, Serialize};

use crate::model::ChunkIndexEntry;
use crate::types::Hash32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkProof {
    pub chunk: String,
    pub data_path: String,
    pub data_root: String,
    pub data_size: String,
    pub offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_path: Option<String>,
}

fn b64url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl ChunkProof {
    pub fn from_parts(
        chunk_bytes: &[u8],
        data_path: &[u8],
        data_root: &Hash32,
        entry: &ChunkIndexEntry,
        abs_offset: u64,
        include_tx_path: bool,
    ) -> Self {
        Self {
            chunk: b64url(chunk_bytes),
            data_path: b64url(data_path),
            data_root: b64url(data_root),
            data_size: entry.chunk_size.to_string(),
            offset: abs_offset.to_string(),
            tx_path: if include_tx_path {
                Some(b64url(&entry.tx_path))
            } else {
                None
            },
        }
    }
}
