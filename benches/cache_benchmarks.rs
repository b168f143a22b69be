// Simple benchmarks using criterion instead of unstable test feature
use std::num::NonZeroUsize;
use std::time::Duration;

use compute_cache::{CacheConfig, ComputeCache};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const CACHE_SIZE: usize = 1_000;
const NUM_OPERATIONS: usize = 10_000;

fn make_cache(capacity: usize) -> ComputeCache<u64, u64> {
    let config = CacheConfig {
        capacity: NonZeroUsize::new(capacity).unwrap(),
        positive_ttl: Duration::from_secs(3600),
        negative_ttl: Duration::from_secs(60),
    };
    ComputeCache::new(config, |key: &u64, _: Option<&()>| Ok((key.wrapping_mul(31), 0)))
}

// Simple linear congruential generator for reproducible key sequences.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Lcg { state: seed }
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }
}

fn bench_hit_path(c: &mut Criterion) {
    let cache = make_cache(CACHE_SIZE);
    for key in 0..CACHE_SIZE as u64 {
        cache.get_or_compute(key).unwrap();
    }

    let mut rng = Lcg::new(42);
    c.bench_function("get_or_compute_hit", |b| {
        b.iter(|| {
            let key = rng.next() % CACHE_SIZE as u64;
            black_box(cache.get_or_compute(black_box(key)).unwrap());
        })
    });
}

fn bench_miss_and_evict(c: &mut Criterion) {
    let cache = make_cache(CACHE_SIZE);
    let mut next_key = 0u64;

    c.bench_function("get_or_compute_miss_evict", |b| {
        b.iter(|| {
            // Monotonically increasing keys: every access is a miss and,
            // once warm, an eviction.
            next_key += 1;
            black_box(cache.get_or_compute(black_box(next_key)).unwrap());
        })
    });
}

fn bench_touch(c: &mut Criterion) {
    let cache = make_cache(CACHE_SIZE);
    for key in 0..CACHE_SIZE as u64 {
        cache.get_or_compute(key).unwrap();
    }

    let mut rng = Lcg::new(7);
    c.bench_function("touch", |b| {
        b.iter(|| {
            let key = rng.next() % CACHE_SIZE as u64;
            black_box(cache.touch(black_box(&key)));
        })
    });
}

fn bench_mixed_workload(c: &mut Criterion) {
    let cache = make_cache(CACHE_SIZE);
    let mut rng = Lcg::new(1234);

    c.bench_function("mixed_workload", |b| {
        b.iter(|| {
            for _ in 0..NUM_OPERATIONS / 100 {
                let roll = rng.next();
                let key = roll % (CACHE_SIZE as u64 * 2);
                match roll % 10 {
                    0 => {
                        let _ = cache.insert(key, key);
                    }
                    1 => {
                        let _ = cache.has(&key);
                    }
                    _ => {
                        let _ = black_box(cache.get_or_compute(key));
                    }
                }
            }
        })
    });
}

criterion_group!(
    benches,
    bench_hit_path,
    bench_miss_and_evict,
    bench_touch,
    bench_mixed_workload
);
criterion_main!(benches);
