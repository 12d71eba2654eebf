use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use tablesync_core::{translate_columns, SourceColumn, SyncRequest};
use tablesync_infra::db;
use tablesync_infra::jobs::drain;
use tablesync_infra::source::MemorySource;
use tablesync_infra::{EngineConfig, SyncEngine};

fn columns() -> Vec<SourceColumn> {
    vec![
        SourceColumn::new("ID", "NUMBER").not_null(),
        SourceColumn::new("CUSTOMER", "VARCHAR").with_max_length(64),
        SourceColumn::new("AMOUNT", "NUMBER").with_precision(12, 2),
        SourceColumn::new("PAID", "BOOLEAN"),
        SourceColumn::new("UPDATED_AT", "TIMESTAMP_NTZ"),
    ]
}

fn rows(count: i64) -> Vec<Vec<Value>> {
    (0..count)
        .map(|id| {
            vec![
                json!(id),
                json!(format!("customer-{}", id % 97)),
                json!(id as f64 * 1.25),
                json!(id % 2 == 0),
                json!("2024-06-01 12:00:00.000000"),
            ]
        })
        .collect()
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_schema_translation(c: &mut Criterion) {
    let wide: Vec<SourceColumn> = (0..200)
        .map(|i| match i % 4 {
            0 => SourceColumn::new(format!("C{i}"), "NUMBER"),
            1 => SourceColumn::new(format!("C{i}"), "VARCHAR").with_max_length(255),
            2 => SourceColumn::new(format!("C{i}"), "TIMESTAMP_LTZ"),
            _ => SourceColumn::new(format!("C{i}"), "GEOGRAPHY"),
        })
        .collect();

    c.bench_function("translate_200_columns", |b| {
        b.iter(|| translate_columns(black_box(&wide)))
    });
}

fn bench_full_sync_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("full_sync_throughput");
    group.sample_size(20);

    for row_count in [1_000i64, 10_000].iter() {
        group.throughput(Throughput::Elements(*row_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(row_count), row_count, |b, &n| {
            let (engine, source) = rt.block_on(async {
                let pool = db::connect_in_memory().await.unwrap();
                db::migrate(&pool).await.unwrap();
                let source = MemorySource::arc();
                source.add_table("sales", "orders", columns(), rows(n));
                let engine = SyncEngine::new(pool, source.clone(), EngineConfig::default());
                engine.register_table("orders", "sales").await.unwrap();
                (engine, source)
            });

            b.iter(|| {
                rt.block_on(async {
                    engine
                        .start_sync(SyncRequest::full("orders", "sales").with_batch_size(2_000))
                        .await
                        .unwrap();
                    black_box(drain(&engine).await.unwrap());
                })
            });
            drop(source);
        });
    }

    group.finish();
}

fn bench_incremental_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("incremental_append");
    group.sample_size(20);
    group.throughput(Throughput::Elements(500));

    group.bench_function("append_500_rows", |b| {
        let (engine, source) = rt.block_on(async {
            let pool = db::connect_in_memory().await.unwrap();
            db::migrate(&pool).await.unwrap();
            let source = MemorySource::arc();
            source.add_table("sales", "orders", columns(), Vec::new());
            let engine = SyncEngine::new(pool, source.clone(), EngineConfig::default());
            engine.register_table("orders", "sales").await.unwrap();
            (engine, source)
        });

        let mut next_id = 0i64;
        b.iter(|| {
            let batch: Vec<Vec<Value>> = rows(500)
                .into_iter()
                .map(|mut row| {
                    row[0] = json!(next_id);
                    next_id += 1;
                    row
                })
                .collect();
            source.append_rows("sales", "orders", batch);

            rt.block_on(async {
                engine
                    .start_sync(SyncRequest::incremental("orders", "sales", "ID"))
                    .await
                    .unwrap();
                black_box(drain(&engine).await.unwrap());
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_schema_translation,
    bench_full_sync_throughput,
    bench_incremental_append,
);
criterion_main!(benches);
