//! Join throughput: one burst of 1e5 rows per side with ~10% matching join
//! keys, executed as a single step.  Cost must be driven by the number of
//! matches, not by rescans of either side.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use deltaflow::{data::Row, row, Root, ZSet};
use rand::{rngs::StdRng, Rng, SeedableRng};

const SIDE: usize = 100_000;
// Left draws keys from [0, 1e6), right from [9e5, 1.9e6): ~10% overlap.
const KEY_SPACE: i64 = 1_000_000;
const RIGHT_OFFSET: i64 = 900_000;

fn build(join_mode_append_only: bool) -> Root {
    let (root, (left, right)) = Root::build(|circuit| {
        let (left_stream, left) = circuit.add_input::<ZSet<Row>>("left")?;
        let (right_stream, right) = circuit.add_input::<ZSet<Row>>("right")?;
        let joined = if join_mode_append_only {
            left_stream.join_append_only(
                &right_stream,
                |row: &Row| row.col(1).clone(),
                |row: &Row| row.col(0).clone(),
            )
        } else {
            left_stream.join(
                &right_stream,
                |row: &Row| row.col(1).clone(),
                |row: &Row| row.col(0).clone(),
            )
        };
        let mut pairs = 0usize;
        joined.inspect(move |delta| pairs += delta.len());
        Ok((left, right))
    })
    .unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut left_batch = ZSet::with_capacity(SIDE);
    let mut right_batch = ZSet::with_capacity(SIDE);
    for n in 0..SIDE {
        left_batch.insert(row![n as i64, rng.gen_range(0..KEY_SPACE)], 1);
        right_batch.insert(
            row![rng.gen_range(RIGHT_OFFSET..RIGHT_OFFSET + KEY_SPACE), n as i64],
            1,
        );
    }
    left.send(left_batch);
    right.send(right_batch);
    root
}

fn join_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_burst");
    group.sample_size(10);

    group.bench_function("append_only", |b| {
        b.iter_batched(
            || build(true),
            |mut root| {
                root.step().unwrap();
                root
            },
            BatchSize::PerIteration,
        )
    });

    group.bench_function("indexed", |b| {
        b.iter_batched(
            || build(false),
            |mut root| {
                root.step().unwrap();
                root
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(benches, join_burst);
criterion_main!(benches);
