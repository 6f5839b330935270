//! Benchmarks for stage throughput
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;
use workers_rs::pipeline::{CancelToken, FieldStore, Stage, Worker};

const ITEMS: u64 = 10_000;

fn multiplier(name: &str, cancel: CancelToken, concurrency: usize) -> workers_rs::StageBuilder<u64, u64> {
    Stage::builder(name, cancel, |w: &Worker<u64, u64>| {
        let factor = w.try_field_int("factor")? as u64;
        for item in w.inputs() {
            w.emit(item.wrapping_mul(factor))?;
        }
        Ok(())
    })
    .concurrency(concurrency)
    .field("factor", 2)
}

fn run_chain(concurrency: usize, items: u64) -> u64 {
    let cancel = CancelToken::new();
    let first = multiplier("first", cancel.clone(), concurrency)
        .start()
        .unwrap();
    let second = multiplier("second", cancel, concurrency)
        .link_from(&first)
        .start()
        .unwrap();

    let feeder = {
        let first = first.clone();
        thread::spawn(move || {
            for i in 0..items {
                first.send(i).unwrap();
            }
            first.close().unwrap();
        })
    };

    let sum = second.outputs().fold(0u64, |acc, v| acc.wrapping_add(v));
    feeder.join().unwrap();
    first.join().unwrap();
    second.join().unwrap();
    sum
}

fn bench_linked_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("linked_stages");
    group.sample_size(20);

    for concurrency in [1usize, 2, 4, 10].iter() {
        group.throughput(Throughput::Elements(ITEMS));
        group.bench_with_input(
            BenchmarkId::new("x2_then_x2", concurrency),
            concurrency,
            |b, &concurrency| {
                b.iter(|| black_box(run_chain(concurrency, ITEMS)));
            },
        );
    }

    group.finish();
}

fn bench_stage_startup(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_startup");

    for concurrency in [1usize, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::new("start_close_join", concurrency),
            concurrency,
            |b, &concurrency| {
                b.iter(|| {
                    let stage = multiplier("startup", CancelToken::new(), concurrency)
                        .start()
                        .unwrap();
                    stage.close().unwrap();
                    stage.join().unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_field_lookup(c: &mut Criterion) {
    let mut fields = FieldStore::new();
    for i in 0..32 {
        fields.insert(format!("field{}", i), i);
    }
    fields
        .insert_object("config", &serde_json::json!({ "amount_to_multiply": 4 }))
        .unwrap();

    c.bench_function("field_get_int", |b| {
        b.iter(|| black_box(fields.get_int(black_box("field17"))));
    });

    c.bench_function("field_get_object", |b| {
        b.iter(|| black_box(fields.get_object::<serde_json::Value>(black_box("config")).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_linked_stages,
    bench_stage_startup,
    bench_field_lookup,
);
criterion_main!(benches);
