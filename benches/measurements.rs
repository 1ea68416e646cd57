//! Benchmarks for the measurement store
//!
//! Run with: cargo bench

use cellpipe::{ImageNumber, Measurements};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

/// Plate/well metadata for `count` image sets, 96 wells per plate
fn plate_store(count: u32) -> Measurements {
    let mut m = Measurements::new();
    for i in 0..count {
        let n = ImageNumber(i + 1);
        m.add_image_measurement(n, "Metadata_Plate", format!("P{}", i / 96));
        m.add_image_measurement(n, "Metadata_Well", format!("W{:02}", i % 96));
        m.add_image_measurement(n, "Intensity_MeanIntensity_DNA", i as f64 / count as f64);
    }
    m
}

fn bench_image_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_writes");

    for count in [1_000u32, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("float", count), count, |b, &count| {
            b.iter(|| {
                let mut m = Measurements::new();
                for i in 1..=count {
                    m.add_image_measurement(ImageNumber(i), "Intensity_TotalIntensity_DNA", i as f64);
                }
                black_box(m)
            });
        });
    }

    group.finish();
}

fn bench_object_writes(c: &mut Criterion) {
    let values: Vec<f64> = (0..500).map(|i| i as f64 * 0.5).collect();
    c.bench_function("object_writes_500_per_image", |b| {
        b.iter(|| {
            let mut m = Measurements::new();
            for i in 1..=200 {
                m.add_measurement("Nuclei", "AreaShape_Area", ImageNumber(i), values.clone());
            }
            black_box(m)
        });
    });
}

fn bench_groupings(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_groupings");
    let tags = vec!["Plate".to_string(), "Well".to_string()];

    for count in [960u32, 9_600].iter() {
        let store = plate_store(*count);
        group.throughput(Throughput::Elements(*count as u64));
        // A fresh store per iteration so the grouping cache starts empty.
        group.bench_with_input(BenchmarkId::new("uncached", count), &store, |b, store| {
            b.iter_batched(
                || store.clone(),
                |m| black_box(m.get_groupings(&tags)),
                BatchSize::LargeInput,
            );
        });
        store.get_groupings(&tags);
        group.bench_with_input(BenchmarkId::new("cached", count), &store, |b, store| {
            b.iter(|| black_box(store.get_groupings(&tags)));
        });
    }

    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let store = plate_store(2_000);
    let text = store.to_json().unwrap();

    c.bench_function("to_json_2000", |b| b.iter(|| black_box(store.to_json().unwrap())));
    c.bench_function("from_json_2000", |b| {
        b.iter(|| black_box(Measurements::from_json(black_box(&text), None).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_image_writes,
    bench_object_writes,
    bench_groupings,
    bench_json
);
criterion_main!(benches);
