//! Marshal/unmarshal throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tarn::{marshal, unmarshal, Heap, Value};

/// A nested structure with shared strings, tables and doubles.
fn build_tree(heap: &mut Heap, width: usize, depth: usize) -> Value {
    let shared = heap.string("shared-key");
    let mut level = Vec::new();
    for i in 0..width {
        level.push(Value::Int(i as i32));
    }
    let mut node = heap.array(level);
    for _ in 0..depth {
        let table = heap.table(None);
        heap.table_put(table, Value::Ref(shared), Value::Ref(node));
        heap.table_put(table, Value::Float(0.5), Value::Bool(true));
        node = heap.array(vec![Value::Ref(table), Value::Ref(shared)]);
    }
    Value::Ref(node)
}

fn bench_marshal(c: &mut Criterion) {
    let mut heap = Heap::new();
    let value = build_tree(&mut heap, 64, 16);

    c.bench_function("marshal_tree", |b| {
        b.iter(|| {
            let bytes = marshal(black_box(&mut heap), black_box(value), None).unwrap();
            black_box(bytes)
        })
    });
}

fn bench_unmarshal(c: &mut Criterion) {
    let mut heap = Heap::new();
    let value = build_tree(&mut heap, 64, 16);
    let bytes = marshal(&mut heap, value, None).unwrap();

    c.bench_function("unmarshal_tree", |b| {
        b.iter(|| {
            let (out, _) = unmarshal(black_box(&mut heap), black_box(&bytes), None).unwrap();
            black_box(out)
        })
    });
}

fn bench_roundtrip_integers(c: &mut Criterion) {
    let mut heap = Heap::new();
    let values: Vec<Value> = (-500..500).map(Value::Int).collect();
    let arr = heap.array(values);

    c.bench_function("roundtrip_integers", |b| {
        b.iter(|| {
            let bytes = marshal(&mut heap, Value::Ref(arr), None).unwrap();
            let (out, _) = unmarshal(&mut heap, &bytes, None).unwrap();
            black_box(out)
        })
    });
}

criterion_group!(
    benches,
    bench_marshal,
    bench_unmarshal,
    bench_roundtrip_integers
);
criterion_main!(benches);
