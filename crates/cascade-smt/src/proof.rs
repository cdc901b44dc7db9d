//! Inclusion and exclusion proofs
//!
//! A proof carries one sibling hash per depth plus the direction taken at
//! each depth. Verification is a pure function: it rebinds the leaf hash,
//! folds the 256 siblings back up, and compares against an expected root.

use crate::{
    default_leaf_hash, hash_internal, hash_leaf, key_bit, subtree_hash, Hash, Key, SmtError,
    SparseMerkleTree, TREE_DEPTH,
};

/// Merkle proof for one key
///
/// `siblings[d]` is the hash of the sibling subtree at depth `d`; `path[d]`
/// is the direction taken at depth `d` (true = right) and must equal the
/// per-depth bit decomposition of `key`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MerkleProof {
    pub key: Key,
    pub value: Vec<u8>,
    pub is_inclusion: bool,
    pub siblings: Vec<Hash>,
    pub path: Vec<bool>,
    pub leaf_hash: Hash,
}

impl SparseMerkleTree {
    /// Prove that `key` is present with its stored value.
    ///
    /// Proofs are deterministic given the tree's leaf set.
    pub fn generate_inclusion_proof(&self, key: &Key) -> Result<MerkleProof, SmtError> {
        let value = self
            .get(key)
            .ok_or(SmtError::KeyNotFound(*key))?
            .to_vec();
        let leaf_hash = hash_leaf(key, &value);
        let (siblings, path) = self.walk(key);

        Ok(MerkleProof {
            key: *key,
            value,
            is_inclusion: true,
            siblings,
            path,
            leaf_hash,
        })
    }

    /// Prove that `key` is absent: its leaf position holds the default leaf.
    pub fn generate_exclusion_proof(&self, key: &Key) -> Result<MerkleProof, SmtError> {
        if self.exists(key) {
            return Err(SmtError::KeyPresent(*key));
        }
        let (siblings, path) = self.walk(key);

        Ok(MerkleProof {
            key: *key,
            value: Vec::new(),
            is_inclusion: false,
            siblings,
            path,
            leaf_hash: default_leaf_hash(),
        })
    }

    /// Descend from the root to `key`'s leaf position, collecting the
    /// sibling subtree hash at every depth.
    fn walk(&self, key: &Key) -> (Vec<Hash>, Vec<bool>) {
        let entries = self.leaf_hashes();
        let mut siblings = Vec::with_capacity(TREE_DEPTH);
        let mut path = Vec::with_capacity(TREE_DEPTH);

        let mut span: &[(Key, Hash)] = &entries;
        for depth in 0..TREE_DEPTH {
            let split = span.partition_point(|(k, _)| !key_bit(k, depth));
            let bit = key_bit(key, depth);
            let (taken, other) = if bit {
                (&span[split..], &span[..split])
            } else {
                (&span[..split], &span[split..])
            };
            siblings.push(subtree_hash(other, depth + 1));
            path.push(bit);
            span = taken;
        }

        (siblings, path)
    }
}

/// Verify `proof` against `expected_root` for `(key, value)`.
///
/// For exclusion proofs `value` must be empty. Any mismatch between the
/// proof's path and the key bits, or any mutated sibling, value, or root,
/// fails verification.
pub fn verify_proof(proof: &MerkleProof, expected_root: &Hash, key: &Key, value: &[u8]) -> bool {
    if proof.key != *key {
        return false;
    }
    if proof.siblings.len() != TREE_DEPTH || proof.path.len() != TREE_DEPTH {
        return false;
    }
    for depth in 0..TREE_DEPTH {
        if proof.path[depth] != key_bit(key, depth) {
            return false;
        }
    }

    let expected_leaf = if proof.is_inclusion {
        if proof.value != value || value.is_empty() {
            return false;
        }
        hash_leaf(key, value)
    } else {
        if !value.is_empty() || !proof.value.is_empty() {
            return false;
        }
        default_leaf_hash()
    };
    if proof.leaf_hash != expected_leaf {
        return false;
    }

    let mut acc = proof.leaf_hash;
    for depth in (0..TREE_DEPTH).rev() {
        acc = if proof.path[depth] {
            hash_internal(&proof.siblings[depth], &acc)
        } else {
            hash_internal(&acc, &proof.siblings[depth])
        };
    }
    acc == *expected_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: u8) -> Key {
        let mut k = [0u8; 32];
        k[0] = n;
        k
    }

    fn populated() -> SparseMerkleTree {
        let mut tree = SparseMerkleTree::new();
        for i in 1..=8u8 {
            let mut k = [0u8; 32];
            k[0] = i;
            k[31] = i.wrapping_mul(41);
            tree.set(k, vec![i, i, i]);
        }
        tree
    }

    #[test]
    fn test_inclusion_roundtrip() {
        let tree = populated();
        let root = tree.root();

        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let proof = tree.generate_inclusion_proof(&k).unwrap();
        assert!(proof.is_inclusion);
        assert!(verify_proof(&proof, &root, &k, &[3, 3, 3]));
    }

    #[test]
    fn test_exclusion_roundtrip() {
        let tree = populated();
        let root = tree.root();
        let absent = key(0xEE);

        let proof = tree.generate_exclusion_proof(&absent).unwrap();
        assert!(!proof.is_inclusion);
        assert_eq!(proof.leaf_hash, default_leaf_hash());
        assert!(verify_proof(&proof, &root, &absent, &[]));
    }

    #[test]
    fn test_inclusion_of_missing_key_fails() {
        let tree = populated();
        assert!(matches!(
            tree.generate_inclusion_proof(&key(0xEE)),
            Err(SmtError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_exclusion_of_present_key_fails() {
        let mut tree = SparseMerkleTree::new();
        tree.set(key(1), vec![1]);
        assert!(matches!(
            tree.generate_exclusion_proof(&key(1)),
            Err(SmtError::KeyPresent(_))
        ));
    }

    #[test]
    fn test_wrong_value_rejected() {
        let tree = populated();
        let root = tree.root();

        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let proof = tree.generate_inclusion_proof(&k).unwrap();
        assert!(!verify_proof(&proof, &root, &k, &[9, 9, 9]));
    }

    #[test]
    fn test_wrong_root_rejected() {
        let tree = populated();
        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let proof = tree.generate_inclusion_proof(&k).unwrap();
        let bad_root = [0xFF; 32];
        assert!(!verify_proof(&proof, &bad_root, &k, &[3, 3, 3]));
    }

    #[test]
    fn test_tampered_sibling_rejected() {
        let tree = populated();
        let root = tree.root();
        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let mut proof = tree.generate_inclusion_proof(&k).unwrap();
        proof.siblings[128][0] ^= 0x01;
        assert!(!verify_proof(&proof, &root, &k, &[3, 3, 3]));
    }

    #[test]
    fn test_tampered_path_rejected() {
        let tree = populated();
        let root = tree.root();
        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let mut proof = tree.generate_inclusion_proof(&k).unwrap();
        proof.path[200] = !proof.path[200];
        assert!(!verify_proof(&proof, &root, &k, &[3, 3, 3]));
    }

    #[test]
    fn test_exclusion_with_value_rejected() {
        let tree = populated();
        let root = tree.root();
        let absent = key(0xEE);

        let proof = tree.generate_exclusion_proof(&absent).unwrap();
        assert!(!verify_proof(&proof, &root, &absent, &[1]));
    }

    #[test]
    fn test_proof_deterministic() {
        let tree = populated();
        let mut k = [0u8; 32];
        k[0] = 3;
        k[31] = 3u8.wrapping_mul(41);

        let p1 = tree.generate_inclusion_proof(&k).unwrap();
        let p2 = tree.generate_inclusion_proof(&k).unwrap();
        assert_eq!(p1, p2);
    }

    proptest! {
        // inclusion holds for every inserted key, exclusion for absent keys,
        // and roots are insertion-order independent
        #[test]
        fn prop_inclusion_exclusion(
            entries in proptest::collection::btree_map(
                proptest::array::uniform32(any::<u8>()),
                proptest::collection::vec(any::<u8>(), 1..16),
                1..24,
            ),
            absent in proptest::array::uniform32(any::<u8>()),
        ) {
            let mut tree = SparseMerkleTree::new();
            for (k, v) in &entries {
                tree.set(*k, v.clone());
            }
            let root = tree.root();

            for (k, v) in &entries {
                let proof = tree.generate_inclusion_proof(k).unwrap();
                prop_assert!(verify_proof(&proof, &root, k, v));
            }

            if !entries.contains_key(&absent) {
                let proof = tree.generate_exclusion_proof(&absent).unwrap();
                prop_assert!(verify_proof(&proof, &root, &absent, &[]));
            }
        }

        #[test]
        fn prop_root_order_independent(
            entries in proptest::collection::vec(
                (proptest::array::uniform32(any::<u8>()),
                 proptest::collection::vec(any::<u8>(), 1..8)),
                2..16,
            ),
        ) {
            let mut forward = SparseMerkleTree::new();
            for (k, v) in &entries {
                forward.set(*k, v.clone());
            }

            let mut reversed = SparseMerkleTree::new();
            for (k, v) in entries.iter().rev() {
                reversed.set(*k, v.clone());
            }

            prop_assert_eq!(forward.root(), reversed.root());
        }

        #[test]
        fn prop_single_bit_mutation_fails(
            k in proptest::array::uniform32(any::<u8>()),
            v in proptest::collection::vec(any::<u8>(), 1..8),
            bit in 0usize..256,
        ) {
            let mut tree = SparseMerkleTree::new();
            tree.set(k, v.clone());
            let root = tree.root();

            let proof = tree.generate_inclusion_proof(&k).unwrap();

            let mut bad_root = root;
            bad_root[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!verify_proof(&proof, &bad_root, &k, &v));

            let mut bad = proof.clone();
            bad.siblings[bit % TREE_DEPTH][0] ^= 0x01;
            prop_assert!(!verify_proof(&bad, &root, &k, &v));
        }
    }
}
