use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use minidb::catalog::{Column, Schema};
use minidb::common::{DataType, Value};
use minidb::index::{encode_key, BTree};
use minidb::storage::tuple::{deserialize_row, serialize_row};
use minidb::storage::{BufferPool, Page, Rid};

fn bench_page(c: &mut Criterion) {
    let tuple = vec![0xABu8; 64];
    c.bench_function("page_insert_64b_tuples", |b| {
        b.iter(|| {
            let mut page = Page::new(1);
            while page.insert_tuple(black_box(&tuple)).is_ok() {}
            black_box(page.num_slots())
        })
    });

    c.bench_function("page_serialize_with_crc", |b| {
        let mut page = Page::new(1);
        while page.insert_tuple(&tuple).is_ok() {}
        b.iter(|| black_box(page.to_bytes()))
    });
}

fn bench_tuple_codec(c: &mut Criterion) {
    let schema = Schema::new(vec![
        Column::new("id", DataType::Int, false),
        Column::new("name", DataType::String, true),
        Column::new("score", DataType::Float, true),
        Column::new("active", DataType::Boolean, true),
    ]);
    let row = vec![
        Value::Int(42),
        Value::Str("a moderately sized string value".to_string()),
        Value::Float(3.125),
        Value::Bool(true),
    ];
    let bytes = serialize_row(&row, &schema).unwrap();

    c.bench_function("tuple_serialize", |b| {
        b.iter(|| black_box(serialize_row(black_box(&row), &schema).unwrap()))
    });
    c.bench_function("tuple_deserialize", |b| {
        b.iter(|| black_box(deserialize_row(black_box(&bytes), &schema).unwrap()))
    });
}

fn bench_key_encoding(c: &mut Criterion) {
    c.bench_function("encode_int_key", |b| {
        b.iter(|| black_box(encode_key(black_box(&Value::Int(-123456)), DataType::Int).unwrap()))
    });
    c.bench_function("encode_string_key", |b| {
        let v = Value::Str("customer_name_with_some_length".to_string());
        b.iter(|| black_box(encode_key(black_box(&v), DataType::String).unwrap()))
    });
}

fn bench_btree(c: &mut Criterion) {
    c.bench_function("btree_insert_1000", |b| {
        b.iter(|| {
            let dir = tempfile::TempDir::new().unwrap();
            let buffer = Arc::new(BufferPool::new(128));
            let mut tree =
                BTree::create(&dir.path().join("bench.idx"), "t", "x", DataType::Int, buffer)
                    .unwrap();
            for i in 0..1000 {
                tree.insert(&Value::Int(i), Rid::new(1, (i % 100) as u16)).unwrap();
            }
            black_box(tree.entry_count())
        })
    });

    let dir = tempfile::TempDir::new().unwrap();
    let buffer = Arc::new(BufferPool::new(128));
    let mut tree = BTree::create(
        &dir.path().join("probe.idx"),
        "t",
        "x",
        DataType::Int,
        buffer,
    )
    .unwrap();
    for i in 0..10_000 {
        tree.insert(&Value::Int(i), Rid::new((i / 100) as u32 + 1, (i % 100) as u16))
            .unwrap();
    }
    c.bench_function("btree_point_search_10k", |b| {
        let mut probe = 0;
        b.iter(|| {
            probe = (probe + 7919) % 10_000;
            black_box(tree.search(&Value::Int(probe)).unwrap())
        })
    });
}

criterion_group!(benches, bench_page, bench_tuple_codec, bench_key_encoding, bench_btree);
criterion_main!(benches);
