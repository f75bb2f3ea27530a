use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use concurrent_size::SizeBst;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const KEYS: usize = 1 << 12;

// Measures `size` while other threads insert and remove.
fn size_under_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_under_updates");
    let cpus = num_cpus::get_physical();

    let mut counts = vec![1, cpus / 2, cpus - 1];
    counts.retain(|&w| w > 0);
    counts.sort();
    counts.dedup();

    for writers in counts {
        group.bench_function(format!("writers={writers}"), |b| {
            let tree = SizeBst::<usize, usize>::new();
            let stop = AtomicBool::new(false);
            let barrier = Barrier::new(writers + 1);

            thread::scope(|s| {
                for t in 0..writers {
                    let (tree, stop, barrier) = (&tree, &stop, &barrier);
                    s.spawn(move || {
                        let handle = tree.handle().unwrap();
                        barrier.wait();

                        let mut i = t;
                        while !stop.load(Ordering::Relaxed) {
                            let key = i % KEYS;
                            if handle.insert_if_absent(key, key).is_some() {
                                handle.remove(&key);
                            }
                            i = i.wrapping_add(writers);
                        }
                    });
                }

                let handle = tree.handle().unwrap();
                barrier.wait();
                b.iter(|| black_box(handle.size()));
                stop.store(true, Ordering::Relaxed);
            });
        });
    }

    group.finish();
}

// Measures concurrent `size` calls competing to collect the same snapshot.
fn concurrent_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_sizes");
    let cpus = num_cpus::get_physical();

    group.bench_function(format!("threads={cpus}"), |b| {
        let tree = SizeBst::<usize, usize>::new();
        {
            let handle = tree.handle().unwrap();
            for i in 0..KEYS {
                handle.insert(i, i);
            }
        }

        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..cpus {
                    s.spawn(|| {
                        let handle = tree.handle().unwrap();
                        for _ in 0..64 {
                            assert_eq!(black_box(handle.size()), KEYS);
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, size_under_updates, concurrent_sizes);
criterion_main!(benches);
