use std::collections::BTreeMap;

use concurrent_size::SizeBst;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SIZE: usize = 10_000;

#[derive(Clone, Copy)]
struct RandomKeys {
    state: usize,
}

impl RandomKeys {
    fn new() -> Self {
        RandomKeys { state: 0 }
    }
}

impl Iterator for RandomKeys {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        // Add 1 then multiply by some 32 bit prime.
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state)
    }
}

fn read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    group.bench_function("concurrent-size", |b| {
        let tree = SizeBst::<usize, usize>::builder()
            .collector(seize::Collector::new().batch_size(1024))
            .build();
        let handle = tree.handle().unwrap();

        for i in RandomKeys::new().take(SIZE) {
            handle.insert(i, i);
        }

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(handle.get(&i), Some(i)));
            }
        });
    });

    group.bench_function("std", |b| {
        let mut m = BTreeMap::<usize, usize>::default();
        for i in RandomKeys::new().take(SIZE) {
            m.insert(i, i);
        }

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(m.get(&i), Some(&i)));
            }
        });
    });

    group.finish();
}

fn insert_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_remove");

    group.bench_function("concurrent-size", |b| {
        let tree = SizeBst::<usize, usize>::new();
        let handle = tree.handle().unwrap();

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(handle.insert(i, i));
            }
            for i in RandomKeys::new().take(SIZE) {
                black_box(handle.remove(&i));
            }
        });
    });

    group.bench_function("std", |b| {
        let mut m = BTreeMap::<usize, usize>::default();

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(m.insert(i, i));
            }
            for i in RandomKeys::new().take(SIZE) {
                black_box(m.remove(&i));
            }
        });
    });

    group.finish();
}

fn size(c: &mut Criterion) {
    let mut group = c.benchmark_group("size");

    for threads in [16, 64, 256] {
        group.bench_function(format!("max_threads={threads}"), |b| {
            let tree = SizeBst::<usize, usize>::with_max_threads(threads);
            let handle = tree.handle().unwrap();
            for i in RandomKeys::new().take(SIZE) {
                handle.insert(i, i);
            }

            b.iter(|| black_box(handle.size()));
        });
    }

    group.finish();
}

criterion_group!(benches, read, insert_remove, size);
criterion_main!(benches);
