// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Micro-benchmarks of the engine's hot paths: buffer pool round trips,
//! layout writes, and thread-local slice lifting.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use tidal::infrastructure::memory::buffer_manager::BufferManager;
use tidal::{DataType, MemoryLayoutType, Schema};
use tidal_domain::{
    aggregation_for, AggregationFunction, AggregationKind, FieldValue, MemoryLayout,
    ThreadLocalSliceStore,
};

fn bench_buffer_pool(c: &mut Criterion) {
    let manager = BufferManager::new(64, 4096).unwrap();
    let mut group = c.benchmark_group("buffer_pool");
    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let buffer = manager.get_buffer_blocking().unwrap();
            std::hint::black_box(&buffer);
        })
    });
    group.finish();
}

fn bench_row_layout_writes(c: &mut Criterion) {
    let schema = Schema::build(
        MemoryLayoutType::Row,
        [
            ("b$key", DataType::UInt64),
            ("b$value", DataType::Int64),
            ("b$ts", DataType::UInt64),
        ],
    )
    .unwrap();
    let layout = MemoryLayout::for_schema(&schema, 4096).unwrap();
    let rows = layout.capacity();
    let mut bytes = vec![0u8; 4096];

    let mut group = c.benchmark_group("row_layout");
    group.throughput(Throughput::Elements(rows as u64));
    group.bench_function("fill_buffer", |b| {
        b.iter(|| {
            for row in 0..rows {
                layout.write_u64(&mut bytes, row, 0, row as u64).unwrap();
                layout.write_i64(&mut bytes, row, 1, row as i64).unwrap();
                layout.write_u64(&mut bytes, row, 2, row as u64).unwrap();
            }
            std::hint::black_box(&bytes);
        })
    });
    group.finish();
}

fn bench_slice_lifting(c: &mut Criterion) {
    let aggregations: Vec<Arc<dyn AggregationFunction>> =
        vec![aggregation_for(AggregationKind::Sum)];
    let mut group = c.benchmark_group("window_build");
    group.throughput(Throughput::Elements(1024));
    group.bench_function("lift_1024_records", |b| {
        b.iter(|| {
            let mut store = ThreadLocalSliceStore::new(100);
            for i in 0u64..1024 {
                let slice = store.slice_for(i % 1000).unwrap();
                let states = slice.states_for(i % 8, &aggregations);
                aggregations[0]
                    .lift(&mut states[0], &FieldValue::Int64(1))
                    .unwrap();
            }
            std::hint::black_box(&store);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_buffer_pool, bench_row_layout_writes, bench_slice_lifting);
criterion_main!(benches);
