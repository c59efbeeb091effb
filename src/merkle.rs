/// Merkle primitives and the proof-composition rule that sits on top of
/// them.
///
/// `MerkleVerify` is treated as an external collaborator: the engine only
/// ever calls `validate_path` twice per chunk (data-path then tx-path) and
/// never inspects tree internals. `Sha256MerkleTree` is the concrete
/// implementation used outside of tests that swap in a fake.
use sha2::{Digest, Sha256};

use crate::types::Hash32;

/// Result of a single successful path validation: which leaf it resolved to
/// and the byte range that leaf covers under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResult {
    pub leaf_id: Hash32,
    pub start: u64,
    pub end: u64,
}

/// A tree leaf: content hash plus the cumulative byte offset marking its
/// right edge (as in Arweave's "max_byte_range" construction).
#[derive(Debug, Clone, Copy)]
pub struct Leaf {
    pub hash: Hash32,
    pub max_byte_range: u64,
}

pub trait MerkleVerify: Send + Sync {
    /// Validates `path` against `root` for an access at `offset` (strictly
    /// less than `size`, the tree's total byte range). Returns the leaf id
    /// and exact `[start, end)` range that `offset` resolved to.
    fn validate_path(&self, root: &Hash32, offset: u64, size: u64, path: &[u8]) -> Option<PathResult>;

    /// Builds a tree over `leaves` (already in order), returning the root
    /// hash and an opaque serialized tree blob `generate_path` can index.
    fn generate_tree(&self, leaves: &[Leaf]) -> (Hash32, Vec<u8>);

    /// Recovers the authentication path from `offset` to `root` inside a
    /// tree previously produced by `generate_tree`.
    fn generate_path(&self, root: &Hash32, offset: u64, tree: &[u8]) -> Option<Vec<u8>>;
}

fn hash_pair(left: &Hash32, right: &Hash32, note: u64) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.update(note.to_be_bytes());
    let out = hasher.finalize();
    let mut h = [0u8; 32];
    h.copy_from_slice(&out);
    h
}

fn hash_leaf(leaf: &Leaf) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(leaf.hash);
    hasher.update(leaf.max_byte_range.to_be_bytes());
    let out = hasher.finalize();
    let mut h = [0u8; 32];
    h.copy_from_slice(&out);
    h
}

/// Internal node kept while building the tree, so `generate_path` can walk
/// back down from the root.
#[derive(Clone)]
enum Node {
    Leaf(Leaf),
    Branch {
        left: Box<Node>,
        right: Box<Node>,
        left_max: u64,
        digest: Hash32,
    },
}

impl Node {
    fn digest(&self) -> Hash32 {
        match self {
            Node::Leaf(l) => hash_leaf(l),
            Node::Branch { digest, .. } => *digest,
        }
    }

    fn max_byte_range(&self) -> u64 {
        match self {
            Node::Leaf(l) => l.max_byte_range,
            Node::Branch { right, .. } => right.max_byte_range(),
        }
    }
}

fn build(nodes: Vec<Node>) -> Node {
    let mut level = nodes;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.into_iter().peekable();
        while let Some(left) = it.next() {
            if let Some(_right) = it.peek() {
                let right = it.next().unwrap();
                let left_max = left.max_byte_range();
                let digest = hash_pair(&left.digest(), &right.digest(), left_max);
                next.push(Node::Branch {
                    left: Box::new(left),
                    right: Box::new(right),
                    left_max,
                    digest,
                });
            } else {
                // odd node out carries forward unchanged to the next level.
                next.push(left);
            }
        }
        level = next;
    }
    level.into_iter().next().expect("tree built from >=1 leaf")
}

/// Path encoding: a flat list of `(marker: u8, left: [u8;32], right: [u8;32], split: u64be)`
/// branch records from root to leaf, terminated by the leaf's own hash and range.
const BRANCH_MARK: u8 = 0;
const LEAF_MARK: u8 = 1;

fn serialize_path(path: &[PathStep]) -> Vec<u8> {
    let mut out = Vec::new();
    for step in path {
        match step {
            PathStep::Branch { left, right, split } => {
                out.push(BRANCH_MARK);
                out.extend_from_slice(left);
                out.extend_from_slice(right);
                out.extend_from_slice(&split.to_be_bytes());
            }
            PathStep::Leaf { hash, max_byte_range } => {
                out.push(LEAF_MARK);
                out.extend_from_slice(hash);
                out.extend_from_slice(&max_byte_range.to_be_bytes());
            }
        }
    }
    out
}

#[derive(Clone, Copy)]
enum PathStep {
    Branch { left: Hash32, right: Hash32, split: u64 },
    Leaf { hash: Hash32, max_byte_range: u64 },
}

fn collect_path(node: &Node, offset: u64, out: &mut Vec<PathStep>) {
    match node {
        Node::Leaf(l) => out.push(PathStep::Leaf {
            hash: l.hash,
            max_byte_range: l.max_byte_range,
        }),
        Node::Branch { left, right, left_max, .. } => {
            out.push(PathStep::Branch {
                left: left.digest(),
                right: right.digest(),
                split: *left_max,
            });
            if offset < *left_max {
                collect_path(left, offset, out);
            } else {
                collect_path(right, offset, out);
            }
        }
    }
}

pub struct Sha256MerkleTree;

impl MerkleVerify for Sha256MerkleTree {
    fn validate_path(&self, root: &Hash32, offset: u64, size: u64, path: &[u8]) -> Option<PathResult> {
        if offset >= size {
            return None;
        }
        let mut cursor = 0usize;
        let mut expected = *root;
        let mut left_bound = 0u64;
        let mut right_bound = size;
        loop {
            let mark = *path.get(cursor)?;
            cursor += 1;
            match mark {
                BRANCH_MARK => {
                    let left: Hash32 = path.get(cursor..cursor + 32)?.try_into().ok()?;
                    cursor += 32;
                    let right: Hash32 = path.get(cursor..cursor + 32)?.try_into().ok()?;
                    cursor += 32;
                    let split_bytes = path.get(cursor..cursor + 8)?;
                    let split = u64::from_be_bytes(split_bytes.try_into().ok()?);
                    cursor += 8;
                    if hash_pair(&left, &right, split) != expected {
                        return None;
                    }
                    if offset < split {
                        expected = left;
                        right_bound = split;
                    } else {
                        expected = right;
                        left_bound = split;
                    }
                }
                LEAF_MARK => {
                    let hash: Hash32 = path.get(cursor..cursor + 32)?.try_into().ok()?;
                    cursor += 32;
                    let range_bytes = path.get(cursor..cursor + 8)?;
                    let max_byte_range = u64::from_be_bytes(range_bytes.try_into().ok()?);
                    let leaf = Leaf { hash, max_byte_range };
                    if hash_leaf(&leaf) != expected {
                        return None;
                    }
                    let end = left_bound + (max_byte_range - left_bound).min(right_bound - left_bound);
                    return Some(PathResult {
                        leaf_id: hash,
                        start: left_bound,
                        end,
                    });
                }
                _ => return None,
            }
        }
    }

    fn generate_tree(&self, leaves: &[Leaf]) -> (Hash32, Vec<u8>) {
        assert!(!leaves.is_empty(), "cannot build a tree over zero leaves");
        let nodes: Vec<Node> = leaves.iter().copied().map(Node::Leaf).collect();
        let root_node = build(nodes);
        let root = root_node.digest();
        let blob = serialize_tree(&root_node);
        (root, blob)
    }

    fn generate_path(&self, root: &Hash32, offset: u64, tree: &[u8]) -> Option<Vec<u8>> {
        let node = deserialize_tree(tree)?;
        if node.digest() != *root {
            return None;
        }
        let mut steps = Vec::new();
        collect_path(&node, offset, &mut steps);
        Some(serialize_path(&steps))
    }
}

// Tree (de)serialization mirrors the path encoding: a preorder dump of
// branch/leaf records, which is enough to reconstruct pointers because every
// branch's left subtree comes immediately after it.
fn serialize_tree(node: &Node) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_tree_into(node, &mut out);
    out
}

fn serialize_tree_into(node: &Node, out: &mut Vec<u8>) {
    match node {
        Node::Leaf(l) => {
            out.push(LEAF_MARK);
            out.extend_from_slice(&l.hash);
            out.extend_from_slice(&l.max_byte_range.to_be_bytes());
        }
        Node::Branch { left, right, left_max, .. } => {
            out.push(BRANCH_MARK);
            out.extend_from_slice(&left_max.to_be_bytes());
            serialize_tree_into(left, out);
            serialize_tree_into(right, out);
        }
    }
}

fn deserialize_tree(bytes: &[u8]) -> Option<Node> {
    let mut cursor = 0usize;
    deserialize_tree_at(bytes, &mut cursor)
}

fn deserialize_tree_at(bytes: &[u8], cursor: &mut usize) -> Option<Node> {
    let mark = *bytes.get(*cursor)?;
    *cursor += 1;
    match mark {
        LEAF_MARK => {
            let hash: Hash32 = bytes.get(*cursor..*cursor + 32)?.try_into().ok()?;
            *cursor += 32;
            let range = u64::from_be_bytes(bytes.get(*cursor..*cursor + 8)?.try_into().ok()?);
            *cursor += 8;
            Some(Node::Leaf(Leaf { hash, max_byte_range: range }))
        }
        BRANCH_MARK => {
            let left_max = u64::from_be_bytes(bytes.get(*cursor..*cursor + 8)?.try_into().ok()?);
            *cursor += 8;
            let left = deserialize_tree_at(bytes, cursor)?;
            let right = deserialize_tree_at(bytes, cursor)?;
            let digest = hash_pair(&left.digest(), &right.digest(), left_max);
            Some(Node::Branch {
                left: Box::new(left),
                right: Box::new(right),
                left_max,
                digest,
            })
        }
        _ => None,
    }
}

/// Outcome of composing the two nested path validations for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedChunk {
    pub data_path_leaf: Hash32,
    pub chunk_start_in_tx: u64,
    pub chunk_end_in_tx: u64,
}

/// Composes `validate_path(data_root, ...)` and `validate_path(tx_root, ...)`,
/// then checks the chunk's own hash and size. Pure: takes the merkle
/// collaborator as a parameter rather than reaching for a global.
pub fn validate_chunk_proof(
    merkle: &dyn MerkleVerify,
    data_root: &Hash32,
    tx_root: &Hash32,
    offset_in_tx: u64,
    tx_size: u64,
    data_path: &[u8],
    tx_path: &[u8],
    chunk_bytes: &[u8],
    max_chunk_bytes: u64,
) -> Option<ValidatedChunk> {
    let tx_result = merkle.validate_path(tx_root, offset_in_tx, tx_size, tx_path)?;
    let data_path_result = merkle.validate_path(data_root, offset_in_tx - tx_result.start, tx_result.end - tx_result.start, data_path)?;

    let size = data_path_result.end - data_path_result.start;
    if size == 0 || size > max_chunk_bytes {
        return None;
    }
    if chunk_bytes.len() as u64 != size {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(chunk_bytes);
    let digest: Hash32 = hasher.finalize().into();
    if digest != data_path_result.leaf_id {
        // the data-path leaf id authenticates the chunk's hash directly in
        // some encodings; callers that hash data_path instead should compare
        // against that value before calling in. Kept strict here.
        return None;
    }

    Some(ValidatedChunk {
        data_path_leaf: data_path_result.leaf_id,
        chunk_start_in_tx: tx_result.start + data_path_result.start,
        chunk_end_in_tx: tx_result.start + data_path_result.end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_of(bytes: &[u8], cumulative: u64) -> (Leaf, Hash32) {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let h: Hash32 = hasher.finalize().into();
        (
            Leaf {
                hash: h,
                max_byte_range: cumulative,
            },
            h,
        )
    }

    #[test]
    fn single_leaf_tree_round_trips() {
        let tree_impl = Sha256MerkleTree;
        let (leaf, _) = leaf_of(b"hello", 5);
        let (root, blob) = tree_impl.generate_tree(&[leaf]);
        let path = tree_impl.generate_path(&root, 2, &blob).unwrap();
        let result = tree_impl.validate_path(&root, 2, 5, &path).unwrap();
        assert_eq!(result.start, 0);
        assert_eq!(result.end, 5);
        assert_eq!(result.leaf_id, leaf.hash);
    }

    #[test]
    fn multi_leaf_tree_resolves_correct_leaf() {
        let tree_impl = Sha256MerkleTree;
        let (l1, _) = leaf_of(b"aaaa", 4);
        let (l2, _) = leaf_of(b"bbbbbb", 10);
        let (l3, _) = leaf_of(b"cc", 12);
        let (root, blob) = tree_impl.generate_tree(&[l1, l2, l3]);

        let path_for_8 = tree_impl.generate_path(&root, 8, &blob).unwrap();
        let result = tree_impl.validate_path(&root, 8, 12, &path_for_8).unwrap();
        assert_eq!(result.leaf_id, l2.hash);
        assert_eq!((result.start, result.end), (4, 10));

        let path_for_11 = tree_impl.generate_path(&root, 11, &blob).unwrap();
        let result3 = tree_impl.validate_path(&root, 11, 12, &path_for_11).unwrap();
        assert_eq!(result3.leaf_id, l3.hash);
    }

    #[test]
    fn tampered_path_fails_validation() {
        let tree_impl = Sha256MerkleTree;
        let (l1, _) = leaf_of(b"aaaa", 4);
        let (l2, _) = leaf_of(b"bbbbbb", 10);
        let (root, blob) = tree_impl.generate_tree(&[l1, l2]);
        let mut path = tree_impl.generate_path(&root, 2, &blob).unwrap();
        let last = path.len() - 1;
        path[last] ^= 0xFF;
        assert!(tree_impl.validate_path(&root, 2, 10, &path).is_none());
    }

    #[test]
    fn validate_chunk_proof_rejects_oversized_chunk() {
        let tree_impl = Sha256MerkleTree;
        let chunk_bytes = vec![0u8; 10];
        let (data_leaf, _) = leaf_of(&chunk_bytes, 10);
        let (data_root, data_blob) = tree_impl.generate_tree(&[data_leaf]);
        let data_path = tree_impl.generate_path(&data_root, 0, &data_blob).unwrap();

        let tx_leaf = Leaf { hash: data_root, max_byte_range: 10 };
        let (tx_root, tx_blob) = tree_impl.generate_tree(&[tx_leaf]);
        let tx_path = tree_impl.generate_path(&tx_root, 0, &tx_blob).unwrap();

        let result = validate_chunk_proof(
            &tree_impl,
            &data_root,
            &tx_root,
            0,
            10,
            &data_path,
            &tx_path,
            &chunk_bytes,
            5, // max_chunk_bytes smaller than the actual chunk
        );
        assert!(result.is_none());
    }
}
