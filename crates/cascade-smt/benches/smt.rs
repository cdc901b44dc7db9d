//! Sparse Merkle tree benchmarks
//!
//! Usage:
//!   cargo bench -p cascade-smt            # run all benchmarks
//!   cargo bench -p cascade-smt -- root    # root computation only
//!   cargo bench -p cascade-smt -- prove   # proof generation only
//!   cargo bench -p cascade-smt -- verify  # verification only

use cascade_smt::{double_sha256, verify_proof, SparseMerkleTree};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Tree with `leaves` entries under uniformly spread keys
fn populated_tree(leaves: u64) -> SparseMerkleTree {
    let mut tree = SparseMerkleTree::new();
    for i in 0..leaves {
        let key = double_sha256(&i.to_le_bytes());
        tree.set(key, key[..12].to_vec());
    }
    tree
}

fn bench_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("root");

    for size in [16u64, 256, 4096] {
        let tree = populated_tree(size);
        let fresh_key = double_sha256(&u64::MAX.to_le_bytes());

        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                // one mutation invalidates the cache, so every iteration
                // pays for a full recomputation
                let mut tree = tree.clone();
                tree.set(fresh_key, vec![1]);
                black_box(tree.root())
            });
        });
    }

    group.finish();
}

fn bench_prove(c: &mut Criterion) {
    let mut group = c.benchmark_group("prove");

    for size in [16u64, 256, 4096] {
        let tree = populated_tree(size);
        let key = double_sha256(&0u64.to_le_bytes());

        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                let proof = tree.generate_inclusion_proof(black_box(&key)).unwrap();
                black_box(proof)
            });
        });
    }

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let tree = populated_tree(256);
    let key = double_sha256(&0u64.to_le_bytes());
    let value = key[..12].to_vec();
    let root = tree.root();
    let proof = tree.generate_inclusion_proof(&key).unwrap();

    c.bench_function("verify", |b| {
        b.iter(|| black_box(verify_proof(black_box(&proof), &root, &key, &value)));
    });
}

criterion_group!(benches, bench_root, bench_prove, bench_verify);
criterion_main!(benches);
