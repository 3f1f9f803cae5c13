//! Performance Benchmarks for Sparse Graph Memory
//!
//! Run with: cargo bench
//!
//! Benchmarks cover:
//! - Index arithmetic over ragged batches
//! - Hidden-state packing and flattening
//! - Full memory steps with deterministic and learned edge selection

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sparse_gcm::{
    flatten_edges, indexing, pack, GraphConvStack, LearnedEdge, SparseGcm, TemporalBackedge,
};

// ═══════════════════════════════════════════════════════════════════════════
// INDEX ARITHMETIC BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_index_arithmetic(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_arithmetic");
    for b in [8usize, 32, 128].iter() {
        let t: Vec<usize> = (0..*b).map(|i| 16 + i % 7).collect();
        let taus: Vec<usize> = (0..*b).map(|i| 1 + i % 4).collect();
        group.throughput(Throughput::Elements(*b as u64));
        group.bench_with_input(BenchmarkId::from_parameter(b), b, |bench, _| {
            bench.iter(|| {
                let offsets = indexing::batch_offsets(black_box(&t), black_box(&taus));
                let new = indexing::new_node_idxs(&t, &taus);
                let valid = indexing::valid_node_idxs(&t, &taus);
                (offsets, new, valid)
            })
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// CODEC BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn deterministic_engine(feat: usize, graph_size: usize) -> SparseGcm {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let gnn = GraphConvStack::new(&[feat, feat], vb.pp("gnn")).unwrap();
    SparseGcm::new(Box::new(gnn), graph_size)
        .unwrap()
        .with_edge_selectors(vec![Box::new(TemporalBackedge)])
}

fn bench_pack_flatten(c: &mut Criterion) {
    let dev = Device::Cpu;
    let gcm = deterministic_engine(16, 64);
    let mut hidden = None;
    for _ in 0..16 {
        let x = Tensor::rand(-1f32, 1f32, (8, 4, 16), &dev).unwrap();
        let (_, state) = gcm.step(&x, &[4; 8], hidden).unwrap();
        hidden = Some(state);
    }
    let state = hidden.unwrap();

    c.bench_function("pack_hidden", |b| {
        b.iter(|| pack(black_box(&state), 128).unwrap())
    });
    c.bench_function("flatten_edges", |b| {
        b.iter(|| flatten_edges(black_box(&state), &[0; 8]).unwrap())
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// FULL STEP BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_memory_step(c: &mut Criterion) {
    let dev = Device::Cpu;
    let mut group = c.benchmark_group("memory_step");

    let gcm = deterministic_engine(16, 64);
    let x = Tensor::rand(-1f32, 1f32, (8, 2, 16), &dev).unwrap();
    let (_, warm) = gcm.step(&x, &[2; 8], None).unwrap();
    group.bench_function("temporal_backedge", |b| {
        b.iter(|| {
            gcm.step(black_box(&x), &[2; 8], Some(warm.clone()))
                .unwrap()
        })
    });

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let gnn = GraphConvStack::new(&[16, 16], vb.pp("gnn")).unwrap();
    let learned = LearnedEdge::new(16, 3, false, Some(16), vb.pp("edges")).unwrap();
    let learned_gcm = SparseGcm::new(Box::new(gnn), 64)
        .unwrap()
        .with_edge_selectors(vec![Box::new(learned)])
        .with_edge_weights(true);
    let (_, warm_learned) = learned_gcm.step(&x, &[2; 8], None).unwrap();
    group.bench_function("learned_edges", |b| {
        b.iter(|| {
            learned_gcm
                .step(black_box(&x), &[2; 8], Some(warm_learned.clone()))
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_index_arithmetic,
    bench_pack_flatten,
    bench_memory_step
);
criterion_main!(benches);
