/// Key encoding helpers shared by every table in §3's data model.
///
/// All integer keys are big-endian so RocksDB's default byte-order
/// comparator gives numeric ordering for free, which `get_next`/`get_prev`
/// and range scans over `chunks_index`/`tx_offset_index`/etc. depend on.
use crate::types::{AbsoluteOffset, Hash32};

pub fn offset_key(offset: AbsoluteOffset) -> Vec<u8> {
    offset.to_be_bytes().to_vec()
}

pub fn decode_offset_key(key: &[u8]) -> Option<AbsoluteOffset> {
    let arr: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// `data_root_index` key: `data_root ‖ u64 tx_size`.
pub fn data_root_key(data_root: &Hash32, tx_size: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(40);
    k.extend_from_slice(data_root);
    k.extend_from_slice(&tx_size.to_be_bytes());
    k
}

pub fn decode_data_root_key(key: &[u8]) -> Option<(Hash32, u64)> {
    if key.len() != 40 {
        return None;
    }
    let mut root = [0u8; 32];
    root.copy_from_slice(&key[..32]);
    let size = u64::from_be_bytes(key[32..40].try_into().ok()?);
    Some((root, size))
}

/// `disk_pool_chunks_index` key: `u256 timestamp ‖ data_path_hash`. The
/// timestamp is stored as 16 big-endian bytes (wide enough for any
/// microsecond epoch value the engine will ever see, and leaves headroom
/// matching the data model's nominal `u256`).
pub fn disk_pool_key(timestamp_us: u128, data_path_hash: &Hash32) -> Vec<u8> {
    let mut k = Vec::with_capacity(48);
    k.extend_from_slice(&timestamp_us.to_be_bytes());
    k.extend_from_slice(data_path_hash);
    k
}

pub fn decode_disk_pool_key(key: &[u8]) -> Option<(u128, Hash32)> {
    if key.len() != 48 {
        return None;
    }
    let ts = u128::from_be_bytes(key[..16].try_into().ok()?);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&key[16..48]);
    Some((ts, hash))
}

pub fn hash_key(hash: &Hash32) -> Vec<u8> {
    hash.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_keys_order_numerically() {
        let a = offset_key(1);
        let b = offset_key(2);
        let c = offset_key(256);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn offset_key_roundtrips() {
        assert_eq!(decode_offset_key(&offset_key(123_456_789)), Some(123_456_789));
    }

    #[test]
    fn data_root_key_roundtrips() {
        let root = [7u8; 32];
        let k = data_root_key(&root, 524_416);
        assert_eq!(decode_data_root_key(&k), Some((root, 524_416)));
    }

    #[test]
    fn disk_pool_key_roundtrips_and_orders_by_timestamp_first() {
        let h1 = [1u8; 32];
        let h2 = [0u8; 32];
        let k1 = disk_pool_key(100, &h1);
        let k2 = disk_pool_key(101, &h2);
        assert!(k1 < k2);
        assert_eq!(decode_disk_pool_key(&k1), Some((100, h1)));
    }
}
