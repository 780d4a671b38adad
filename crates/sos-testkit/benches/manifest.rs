use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use sos_core::{Digest, Manifest};

fn manifest_of(range: std::ops::Range<u32>) -> Manifest {
    Manifest::new(range.map(|i| Digest::of(&i.to_be_bytes())))
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_diff");
    for size in [1_000u32, 10_000, 100_000] {
        let a = manifest_of(0..size);
        let b = manifest_of(size / 10..size + size / 10);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| Manifest::diff(black_box(&a), black_box(&b)))
        });
    }
    group.finish();
}

fn bench_digest(c: &mut Criterion) {
    let m = manifest_of(0..10_000);
    c.bench_function("manifest_digest_10k", |bench| bench.iter(|| black_box(&m).digest()));
}

fn bench_apply(c: &mut Criterion) {
    let a = manifest_of(0..10_000);
    let b = manifest_of(500..10_500);
    let delta = Manifest::diff(&a, &b);
    c.bench_function("manifest_apply_10k", |bench| {
        bench.iter(|| black_box(&a).apply(black_box(&delta)))
    });
}

criterion_group!(benches, bench_diff, bench_digest, bench_apply);
criterion_main!(benches);
