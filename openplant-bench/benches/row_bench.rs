//! Row codec and compound value benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use openplant_protocol::{OpMap, OpSlice, OpStructure, Row, Table, Value, VarType};

fn point_table() -> Table {
    let mut table = Table::new("Point");
    table.add_column("ID", VarType::Int32, 0).unwrap();
    table.add_column("TM", VarType::DateTime, 0).unwrap();
    table.add_column("DS", VarType::Int16, 0).unwrap();
    table.add_column("GN", VarType::String, 0).unwrap();
    table.add_column("ED", VarType::String, 0).unwrap();
    table.add_column("AV", VarType::Object, 0).unwrap();
    table
}

fn fill(table: &mut Table, rows: usize) {
    let now = chrono::Utc::now();
    for i in 0..rows {
        table
            .set_i32(0, i as i32)
            .set_datetime(1, now)
            .set_i16(2, 0)
            .set_str(3, &format!("W3.NODE.P{i}"))
            .set_str(4, "boiler outlet temperature")
            .set_object(5, i as f64)
            .bind_row()
            .unwrap();
    }
}

fn bench_row_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_build");

    for rows in [100, 10_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            let mut table = point_table();
            b.iter(|| {
                table.clear();
                fill(&mut table, rows);
                black_box(table.row_count())
            });
        });
    }

    group.finish();
}

fn bench_row_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_read");

    let mut table = point_table();
    fill(&mut table, 1000);
    let rows: Vec<Bytes> = table.rows().to_vec();

    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("typed_getters", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for data in &rows {
                let row = Row::parse(&table, data.clone()).unwrap();
                let view = table.view(&row).unwrap();
                sum += view.get_f64(5).unwrap() + view.get_i32(0).unwrap() as f64;
                black_box(view.get_string(3).unwrap());
            }
            black_box(sum)
        });
    });
    group.bench_function("to_record", |b| {
        b.iter(|| {
            for data in &rows {
                let row = Row::parse(&table, data.clone()).unwrap();
                black_box(table.view(&row).unwrap().to_record().unwrap());
            }
        });
    });

    group.finish();
}

fn encoded<F: FnOnce(&mut BytesMut)>(f: F) -> Bytes {
    let mut out = BytesMut::new();
    f(&mut out);
    out.freeze()
}

fn bench_compound_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("compound_decode");

    let doubles: Vec<Value> = (0..1000).map(|i| Value::Double(i as f64)).collect();
    let fixed = OpSlice::from_values(VarType::Double, &doubles).unwrap();
    let fixed = encoded(|out| fixed.encode(out));
    group.bench_function("slice_f64_1000", |b| {
        b.iter(|| {
            let s = OpSlice::decode(&fixed).unwrap().unwrap();
            black_box(s.get(999).unwrap())
        });
    });

    let names: Vec<Value> = (0..1000).map(|i| Value::from(format!("W3.NODE.P{i}"))).collect();
    let strings = OpSlice::from_values(VarType::String, &names).unwrap();
    let strings = encoded(|out| strings.encode(out));
    group.bench_function("slice_str_1000", |b| {
        b.iter(|| {
            let s = OpSlice::decode(&strings).unwrap().unwrap();
            black_box(s.to_vec().unwrap())
        });
    });

    let pairs: Vec<(Value, Value)> = (0..1000)
        .map(|i| (Value::from(format!("P{i}")), Value::Int32(i)))
        .collect();
    let map = OpMap::from_pairs(VarType::String, VarType::Int32, &pairs).unwrap();
    let map = encoded(|out| map.encode(out));
    group.bench_function("map_str_1000", |b| {
        b.iter(|| {
            let m = OpMap::decode(&map).unwrap().unwrap();
            black_box(m.get_str("P500").unwrap())
        });
    });

    let st = OpStructure::builder()
        .field("id", 1024i32)
        .field("name", "W3.NODE.P1")
        .tagged_field("value", "unit=degC", 21.5f64)
        .field("quality", 0i16)
        .build()
        .unwrap();
    let st = encoded(|out| st.encode(out));
    group.bench_function("structure_4_fields", |b| {
        b.iter(|| {
            let s = OpStructure::decode(&st).unwrap().unwrap();
            black_box(s.get("value").unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_row_build, bench_row_read, bench_compound_decode);

criterion_main!(benches);
