/// Shared primitive types and the crate-wide error taxonomy.
///
/// `EngineError` is the production-ready error type with context, in the
/// same spirit as a hand-rolled `Display`/`Error` pair: every caller-visible
/// outcome named in the error taxonomy gets its own variant instead of a
/// single opaque string, so callers can match on it.
use std::fmt;

/// A byte offset into the weave. The inclusive end-offset of a chunk is an
/// `AbsoluteOffset`; every chunk occupies `(start, end]` with
/// `end - start == chunk_size`.
pub type AbsoluteOffset = u64;

/// SHA-256 digest, used for `data_path_hash`, `data_root`, `tx_root`, and
/// transaction ids alike.
pub type Hash32 = [u8; 32];

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Caller-visible error taxonomy (spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has never processed a `join`; no block index is known yet.
    NotJoined,
    /// A Merkle path or size check failed during proof validation.
    InvalidProof,
    /// No path from the supplied data root to a confirmed placement exists,
    /// and the root is not pending in the disk pool either.
    DataRootNotFound,
    /// Admission refused: the disk-pool size limit (per-root or global)
    /// would be exceeded by this chunk.
    ExceedsDiskPoolSizeLimit,
    /// Admission refused: free space is below `DISK_DATA_BUFFER_SIZE` and
    /// the caller did not opt to write past the limit.
    DiskFull,
    /// A read path refused to assemble a transaction because its declared
    /// size exceeds `MAX_SERVED_TX_DATA_SIZE`.
    TxDataTooBig,
    /// The requested item does not exist.
    NotFound,
    /// A chunk specifically was not found (as distinct from "not found" at
    /// large, so read callers can tell a missing leaf from a missing tx).
    ChunkNotFound,
    /// The chunk exists in the index but its bytes could not be read back.
    FailedToReadChunk,
    /// Transaction data could not be assembled from its chunks.
    FailedToGetTxData,
    /// The engine mailbox did not service the call within the caller's
    /// deadline. The mutation is not applied as of this reply, though it
    /// may complete later; callers should read back before retrying.
    Timeout,
    /// A reorg's `join` found no common ancestor between the current
    /// `block_index` and the proposed one. This is treated as fatal: the
    /// engine refuses to proceed rather than silently corrupt indices.
    NoCommonAncestor,
    /// The underlying KV store reported an error.
    Storage(String),
    /// Any other invariant violation surfaced as a string for diagnostics.
    Other(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotJoined => write!(f, "engine has not processed a join yet"),
            EngineError::InvalidProof => write!(f, "invalid proof"),
            EngineError::DataRootNotFound => write!(f, "data root not found"),
            EngineError::ExceedsDiskPoolSizeLimit => write!(f, "exceeds disk pool size limit"),
            EngineError::DiskFull => write!(f, "disk full"),
            EngineError::TxDataTooBig => write!(f, "tx data too big"),
            EngineError::NotFound => write!(f, "not found"),
            EngineError::ChunkNotFound => write!(f, "chunk not found"),
            EngineError::FailedToReadChunk => write!(f, "failed to read chunk"),
            EngineError::FailedToGetTxData => write!(f, "failed to get tx data"),
            EngineError::Timeout => write!(f, "timeout"),
            EngineError::NoCommonAncestor => write!(f, "no common ancestor found during join"),
            EngineError::Storage(msg) => write!(f, "storage error: {}", msg),
            EngineError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Other(format!("encoding error: {}", e))
    }
}

/// Lower-hex formatting helper, matching the teacher's `Hash` newtype: bytes
/// print most-significant-first regardless of the in-memory byte order used
/// by a particular wire format.
pub struct HexHash<'a>(pub &'a [u8]);

impl fmt::LowerHex for HexHash<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(EngineError::DiskFull.to_string(), "disk full");
        assert_eq!(EngineError::InvalidProof.to_string(), "invalid proof");
        assert_eq!(
            EngineError::DataRootNotFound.to_string(),
            "data root not found"
        );
    }

    #[test]
    fn hex_hash_formats_big_endian() {
        let bytes = [0x00u8, 0x01, 0xffu8];
        assert_eq!(format!("{:x}", HexHash(&bytes)), "0001ff");
    }
}
