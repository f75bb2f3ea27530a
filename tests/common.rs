#![allow(dead_code)]

use concurrent_size::{Collector, SizeBst};

// Run the test on different configurations of a `SizeBst`.
pub fn with_tree<K, V>(mut test: impl FnMut(&dyn Fn() -> SizeBst<K, V>)) {
    // Default configuration.
    if !cfg!(concurrent_size_stress) {
        test(&(|| SizeBst::new()));
    }

    // Reclaim eagerly to catch use-after-free of retired nodes and descriptors.
    test(
        &(|| {
            SizeBst::builder()
                .max_threads(threads() * 2)
                .collector(Collector::new().batch_size(1))
                .build()
        }),
    );
}

// Prints a log message if `RUST_LOG=debug` is set.
#[macro_export]
macro_rules! debug {
    ($($x:tt)*) => {
        if std::env::var("RUST_LOG").as_deref() == Ok("debug") {
            println!($($x)*);
        }
    };
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}
