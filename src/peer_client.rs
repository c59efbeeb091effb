/// P2P HTTP client: fetching peer sync records and individual chunks.
///
/// Treated as an external collaborator by the engine, which only ever sees
/// the `PeerClient` trait. `HttpPeerClient` is the `reqwest`-backed
/// implementation used outside tests.
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::interval_set::IntervalSet;
use crate::types::{EngineError, Hash32, Result};

pub type Peer = String;

#[derive(Debug, Clone)]
pub struct PeerChunk {
    pub chunk: Vec<u8>,
    pub data_path: Vec<u8>,
    pub data_root: Hash32,
    pub tx_path: Option<Vec<u8>>,
    pub offset: u64,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn fetch_sync_record(&self, peer: &Peer) -> Result<IntervalSet>;
    async fn fetch_chunk(&self, peer: &Peer, absolute_offset: u64) -> Result<PeerChunk>;
    async fn fetch_peer_list(&self, peer: &Peer) -> Result<Vec<Peer>>;
}

pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builds with a fixed timeout");
        Self { client }
    }
}

#[derive(Deserialize)]
struct SyncRecordIntervalDto(u64, u64); // [end, start], descending per §6

#[derive(Deserialize)]
struct ChunkDto {
    chunk: String,
    data_path: String,
    data_root: String,
    tx_path: Option<String>,
    offset: String,
}

fn decode_b64url(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| EngineError::Other(format!("invalid base64url: {}", e)))
}

fn decode_hash32(s: &str) -> Result<Hash32> {
    let bytes = decode_b64url(s)?;
    bytes
        .try_into()
        .map_err(|_| EngineError::Other("expected 32-byte hash".to_string()))
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch_sync_record(&self, peer: &Peer) -> Result<IntervalSet> {
        let url = format!("{}/data_sync_record", peer);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Other(format!("peer request failed: {}", e)))?;
        let intervals: Vec<SyncRecordIntervalDto> = resp
            .json()
            .await
            .map_err(|e| EngineError::Other(format!("peer response undecodable: {}", e)))?;
        let mut set = IntervalSet::new();
        for SyncRecordIntervalDto(end, start) in intervals {
            set.add(start, end);
        }
        Ok(set)
    }

    async fn fetch_chunk(&self, peer: &Peer, absolute_offset: u64) -> Result<PeerChunk> {
        let url = format!("{}/chunk/{}", peer, absolute_offset);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Other(format!("peer request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(EngineError::ChunkNotFound);
        }
        let dto: ChunkDto = resp
            .json()
            .await
            .map_err(|_| EngineError::FailedToReadChunk)?;
        Ok(PeerChunk {
            chunk: decode_b64url(&dto.chunk)?,
            data_path: decode_b64url(&dto.data_path)?,
            data_root: decode_hash32(&dto.data_root)?,
            tx_path: dto.tx_path.map(|p| decode_b64url(&p)).transpose()?,
            offset: dto
                .offset
                .parse()
                .map_err(|_| EngineError::Other("non-numeric chunk offset".to_string()))?,
        })
    }

    async fn fetch_peer_list(&self, peer: &Peer) -> Result<Vec<Peer>> {
        let url = format!("{}/peers", peer);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Other(format!("peer request failed: {}", e)))?;
        resp.json()
            .await
            .map_err(|e| EngineError::Other(format!("peer list undecodable: {}", e)))
    }
}
