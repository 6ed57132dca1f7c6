/// Benchmarks for the storage kernels.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cubeops::kernels::{IntercubeKind, Primitive, RawRow, ReduceKind};
use cubeops::models::DType;
use cubeops::subset::Subset;

fn fill(rows: u64, array_length: u64) -> Vec<RawRow> {
    Primitive::Fill {
        key_start: 1,
        key_end: rows,
        array_length,
        seed: 1,
    }
    .apply(DType::Double, &[])
    .unwrap()
    .rows
}

fn criterion_benchmark(c: &mut Criterion) {
    for array_length in [16, 1024] {
        let rows = fill(256, array_length);
        let sources = [rows.clone()];
        let pair = [rows.clone(), rows];

        for kind in [ReduceKind::Sum, ReduceKind::Max, ReduceKind::Count] {
            let primitive = Primitive::Reduce(kind);
            c.bench_function(&format!("reduce({kind}, {array_length})"), |b| {
                b.iter(|| primitive.apply(DType::Double, black_box(&sources)).unwrap())
            });
        }

        let primitive = Primitive::Intercube(IntercubeKind::Sub);
        c.bench_function(&format!("intercube(sub, {array_length})"), |b| {
            b.iter(|| primitive.apply(DType::Double, black_box(&pair)).unwrap())
        });

        let primitive = Primitive::Subset {
            sizes: vec![16, 16],
            filters: vec![
                Subset::parse("1:2:end", 16).unwrap(),
                Subset::parse("4:12", 16).unwrap(),
            ],
            implicit: Subset::parse("1:2:end", array_length).unwrap(),
        };
        c.bench_function(&format!("subset({array_length})"), |b| {
            b.iter(|| primitive.apply(DType::Double, black_box(&sources)).unwrap())
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
