use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ramlake::vector::{Embedding, VectorIndex};
use ramlake::{VectorBackend, VectorConfig};

fn point(i: usize, dims: usize) -> Vec<f32> {
    (0..dims)
        .map(|d| ((i * 31 + d * 17) as f32 * 0.013).sin())
        .collect()
}

fn build(backend: VectorBackend, n: usize, dims: usize) -> VectorIndex {
    let index = VectorIndex::from_config(&VectorConfig {
        backend,
        ..Default::default()
    });
    for i in 0..n {
        index
            .index(&format!("doc{}", i), Embedding::new(point(i, dims)).unwrap())
            .unwrap();
    }
    index
}

/// Benchmark: Top-10 search, HNSW vs flat
fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_search");
    let dims = 64;

    for n in [1_000, 5_000] {
        for backend in [VectorBackend::Hnsw, VectorBackend::Flat] {
            let index = build(backend, n, dims);
            let query = point(n + 7, dims);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", backend), n),
                &n,
                |b, _| b.iter(|| black_box(index.search(&query, 10).unwrap())),
            );
        }
    }
    group.finish();
}

/// Benchmark: HNSW insertion
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_insert");
    group.sample_size(10);
    group.bench_function("hnsw_1000x64", |b| {
        b.iter(|| black_box(build(VectorBackend::Hnsw, 1_000, 64)))
    });
    group.finish();
}

criterion_group!(benches, bench_search, bench_insert);
criterion_main!(benches);
