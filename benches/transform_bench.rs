//! Benchmarks for row transformation (projection compile and evaluate).
//!
//! These measure the per-row cost of the schema-evolution hot path: the
//! scan driver and the DML hook both run the row transformer on every
//! row they touch. All operations are pure Rust — no store required.
//!
//! Run with: `cargo bench --bench transform_bench`

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use groupshift::changeset::{Change, ChangeLevel, ChangeSet};
use groupshift::error::GroupShiftError;
use groupshift::expr::{QueryContext, SequenceService};
use groupshift::hkey::{HKey, encode_value};
use groupshift::row::{BoundRow, Row, derive_hkey};
use groupshift::schema::{Column, ColumnDefault, Schema, SequenceId, TableId};
use groupshift::transform::{TransformCache, transform_row};
use groupshift::types::{TypeClass, TypesRegistry, Value};

struct NoopSequence;

impl SequenceService for NoopSequence {
    fn next_value(&self, _seq: SequenceId) -> Result<i64, GroupShiftError> {
        Ok(1)
    }
}

fn old_schema() -> Arc<Schema> {
    Schema::builder(1)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("amount", TypeClass::Double),
            ],
            vec![0],
        )
        .build()
}

fn new_schema() -> Arc<Schema> {
    Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::BigInt).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("amount", TypeClass::Double),
                Column::new("status", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("fresh".into())),
            ],
            vec![0],
        )
        .build()
}

fn sample_row(schema: &Schema, id: i32) -> Box<dyn Row> {
    let t = schema.table(TableId(1)).unwrap();
    let fields = vec![
        Value::Int(id),
        Value::Text(format!("item-{id}")),
        Value::Double(id as f64 * 1.5),
    ];
    let hkey = derive_hkey(schema, TableId(1), &fields).unwrap();
    Box::new(BoundRow::new(t.row_type.clone(), hkey, fields))
}

fn bench_projection_compile(c: &mut Criterion) {
    let old = old_schema();
    let new = new_schema();
    let cs = vec![
        ChangeSet::new(TableId(1), ChangeLevel::Table)
            .with_column(Change::modify("id", "id"))
            .with_column(Change::add("status")),
    ];
    c.bench_function("transform_cache_build", |b| {
        b.iter(|| {
            let cache = TransformCache::build(
                black_box(&cs),
                &old,
                &new,
                &TypesRegistry,
                ChangeLevel::Table,
            )
            .unwrap();
            black_box(cache.len())
        })
    });
}

fn bench_transform_row(c: &mut Criterion) {
    let old = old_schema();
    let new = new_schema();
    let cs = vec![
        ChangeSet::new(TableId(1), ChangeLevel::Table)
            .with_column(Change::modify("id", "id"))
            .with_column(Change::add("status")),
    ];
    let cache =
        TransformCache::build(&cs, &old, &new, &TypesRegistry, ChangeLevel::Table).unwrap();
    let transform = cache.for_table(TableId(1)).unwrap();
    let ctx = QueryContext::new(Arc::new(NoopSequence));

    c.bench_function("transform_row_project", |b| {
        b.iter(|| {
            let row = sample_row(&old, 42);
            let out = transform_row(&ctx, &new, transform, row).unwrap();
            black_box(out.h_key().as_bytes().len())
        })
    });
}

fn bench_hkey_encode(c: &mut Criterion) {
    c.bench_function("hkey_encode_two_segments", |b| {
        b.iter(|| {
            let mut key = HKey::for_root(1, &[Value::BigInt(black_box(123_456_789))]);
            key.push_segment(2, &[Value::Text("order-9999".into())]);
            black_box(key.as_bytes().len())
        })
    });
    c.bench_function("value_encode_text", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(32);
            encode_value(&mut out, black_box(&Value::Text("hello-world".into())));
            black_box(out.len())
        })
    });
}

criterion_group!(
    benches,
    bench_projection_compile,
    bench_transform_row,
    bench_hkey_encode
);
criterion_main!(benches);
