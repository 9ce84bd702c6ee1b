//! Benchmarks for hydrology algorithms

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use demflow_algorithms::hydrology::{
    barnes_flat_resolution_d8, flow_direction, resolve_flats,
};
use demflow_core::{GeoTransform, Raster};

/// Create a terraced basin: concentric flat benches stepping down toward a
/// central outlet ring, so a large share of cells needs flat resolution.
fn create_terraced_dem(size: usize) -> Raster<f64> {
    let mut dem = Raster::new(size, size);
    dem.set_transform(GeoTransform::new(0.0, size as f64, 1.0, -1.0));
    let center = size as f64 / 2.0;
    for row in 0..size {
        for col in 0..size {
            let dx = col as f64 - center;
            let dy = row as f64 - center;
            let dist = (dx * dx + dy * dy).sqrt();
            // 6-cell-wide benches
            dem.set(row, col, (dist / 6.0).floor()).unwrap();
        }
    }
    dem
}

fn bench_flow_direction(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flow_direction");
    for size in [256, 512, 1024] {
        let dem = create_terraced_dem(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| flow_direction(black_box(&dem)).unwrap())
        });
    }
    group.finish();
}

fn bench_resolve_flats(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/resolve_flats");
    for size in [128, 256, 512] {
        let dem = create_terraced_dem(size);
        let fdir = flow_direction(&dem).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| resolve_flats(black_box(&dem), black_box(&fdir)).unwrap())
        });
    }
    group.finish();
}

fn bench_flat_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flat_pipeline");
    for size in [128, 256, 512] {
        let dem = create_terraced_dem(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut dem = dem.clone();
                let mut fdir = dem.with_same_meta::<u8>(size, size);
                barnes_flat_resolution_d8(black_box(&mut dem), &mut fdir, false).unwrap();
                fdir
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_flow_direction,
    bench_resolve_flats,
    bench_flat_pipeline,
);
criterion_main!(benches);
