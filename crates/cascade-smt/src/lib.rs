//! 256-bit sparse Merkle tree over double-SHA-256
//!
//! Authenticated map from 256-bit keys to byte values. The tree is a full
//! binary tree of depth 256 where unoccupied leaf positions carry a fixed
//! default leaf hash; a table of per-depth empty-subtree hashes makes every
//! empty contribution O(1), so hashing n leaves costs O(n * depth) in the
//! worst case and O(depth) for a single leaf.
//!
//! - Leaf hash: `H(0x00 || key || value)`
//! - Internal hash: `H(left || right)`
//! - `H` is double-SHA-256
//!
//! The bit at depth `d` of a key (bit 0 = MSB of the first byte) selects
//! left (0) or right (1). Setting a key to an empty value removes it.

mod proof;

pub use proof::{MerkleProof, verify_proof};

use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// 32-byte hash
pub type Hash = [u8; 32];

/// 256-bit tree key
pub type Key = [u8; 32];

/// Fixed tree depth: one level per key bit
pub const TREE_DEPTH: usize = 256;

/// Leaf domain tag, mixed into every leaf hash
pub const LEAF_TAG: u8 = 0x00;

/// Double-SHA-256 (Bitcoin style)
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Hash a leaf: `H(0x00 || key || value)`
pub fn hash_leaf(key: &Key, value: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(1 + 32 + value.len());
    buf.push(LEAF_TAG);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    double_sha256(&buf)
}

/// Hash two sibling nodes: `H(left || right)`
pub fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    double_sha256(&buf)
}

/// Hash of an unoccupied leaf position
pub fn default_leaf_hash() -> Hash {
    default_hashes()[TREE_DEPTH]
}

/// Per-depth empty-subtree hashes.
///
/// `default_hashes()[d]` is the hash of an empty subtree rooted at depth `d`;
/// index `TREE_DEPTH` is the default leaf, index 0 the empty-tree root.
pub fn default_hashes() -> &'static [Hash; TREE_DEPTH + 1] {
    static TABLE: OnceLock<[Hash; TREE_DEPTH + 1]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0u8; 32]; TREE_DEPTH + 1];
        table[TREE_DEPTH] = double_sha256(&[LEAF_TAG]);
        for d in (0..TREE_DEPTH).rev() {
            table[d] = hash_internal(&table[d + 1], &table[d + 1]);
        }
        table
    })
}

/// Bit of `key` at depth `d`; bit 0 is the MSB of the first byte.
/// Returns true for right, false for left.
#[inline]
pub fn key_bit(key: &Key, depth: usize) -> bool {
    (key[depth / 8] >> (7 - (depth % 8))) & 1 == 1
}

/// Sparse Merkle tree
///
/// Leaves are kept in a `BTreeMap`; lexicographic key order equals the
/// tree's left-to-right leaf order, so subtree hashing partitions a sorted
/// slice by one key bit per level.
#[derive(Clone, Debug, Default)]
pub struct SparseMerkleTree {
    leaves: BTreeMap<Key, Vec<u8>>,
    cached_root: Cell<Option<Hash>>,
}

impl SparseMerkleTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &Key) -> Option<&[u8]> {
        self.leaves.get(key).map(|v| v.as_slice())
    }

    /// Check whether `key` holds a value
    pub fn exists(&self, key: &Key) -> bool {
        self.leaves.contains_key(key)
    }

    /// Number of occupied leaves
    pub fn size(&self) -> usize {
        self.leaves.len()
    }

    /// Insert or update `key`. An empty value is equivalent to `delete`.
    pub fn set(&mut self, key: Key, value: Vec<u8>) {
        if value.is_empty() {
            self.delete(&key);
            return;
        }
        self.leaves.insert(key, value);
        self.cached_root.set(None);
    }

    /// Remove `key`, returning whether it was present
    pub fn delete(&mut self, key: &Key) -> bool {
        let removed = self.leaves.remove(key).is_some();
        if removed {
            self.cached_root.set(None);
        }
        removed
    }

    /// Current root hash. Lazily computed and cached; any mutation
    /// invalidates the cache.
    pub fn root(&self) -> Hash {
        if let Some(root) = self.cached_root.get() {
            return root;
        }
        let entries = self.leaf_hashes();
        let root = subtree_hash(&entries, 0);
        self.cached_root.set(Some(root));
        root
    }

    /// Iterate over occupied leaves in key order
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Vec<u8>)> {
        self.leaves.iter()
    }

    /// Leaf hashes in key order (= left-to-right tree order)
    pub(crate) fn leaf_hashes(&self) -> Vec<(Key, Hash)> {
        self.leaves
            .iter()
            .map(|(k, v)| (*k, hash_leaf(k, v)))
            .collect()
    }
}

/// Hash of the subtree rooted at `depth` containing `entries`, which must be
/// sorted by key and all share the same key prefix above `depth`.
pub(crate) fn subtree_hash(entries: &[(Key, Hash)], depth: usize) -> Hash {
    if entries.is_empty() {
        return default_hashes()[depth];
    }
    if depth == TREE_DEPTH {
        return entries[0].1;
    }
    if entries.len() == 1 {
        // single occupied leaf below: fold defaults up from the bottom
        let (key, leaf) = entries[0];
        let mut acc = leaf;
        for d in (depth..TREE_DEPTH).rev() {
            acc = if key_bit(&key, d) {
                hash_internal(&default_hashes()[d + 1], &acc)
            } else {
                hash_internal(&acc, &default_hashes()[d + 1])
            };
        }
        return acc;
    }
    let split = entries.partition_point(|(k, _)| !key_bit(k, depth));
    let left = subtree_hash(&entries[..split], depth + 1);
    let right = subtree_hash(&entries[split..], depth + 1);
    hash_internal(&left, &right)
}

/// SMT errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmtError {
    #[error("key {} not present", hex::encode(.0))]
    KeyNotFound(Key),

    #[error("key {} already present", hex::encode(.0))]
    KeyPresent(Key),
}
