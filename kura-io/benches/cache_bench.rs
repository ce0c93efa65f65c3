use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kura_io::cache::ReadCache;

fn paths(n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| PathBuf::from(format!("/bench/artifact-{}", i))).collect()
}

fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_hit");
    for shards in [1usize, 16] {
        let cache = ReadCache::with_shards(64 * 1024 * 1024, shards);
        let keys = paths(1024);
        for key in &keys {
            cache.put(key.clone(), Bytes::from(vec![0u8; 4096]));
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(shards), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(cache.get(&keys[i]))
            });
        });
    }
    group.finish();
}

fn bench_put_with_eviction(c: &mut Criterion) {
    let cache = ReadCache::with_shards(1024 * 1024, 16);
    let keys = paths(4096);
    let payload = Bytes::from(vec![0u8; 4096]);

    c.bench_function("cache_put_evicting", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.put(keys[i].clone(), payload.clone()))
        });
    });
}

fn bench_contended_get(c: &mut Criterion) {
    let cache = Arc::new(ReadCache::with_shards(64 * 1024 * 1024, 16));
    let keys = Arc::new(paths(1024));
    for key in keys.iter() {
        cache.put(key.clone(), Bytes::from(vec![0u8; 1024]));
    }

    c.bench_function("cache_get_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let cache = Arc::clone(&cache);
                    let keys = Arc::clone(&keys);
                    std::thread::spawn(move || {
                        for i in 0..256 {
                            black_box(cache.get(&keys[(i * 4 + t) % keys.len()]));
                        }
                    })
                })
                .collect();
            for h in handles {
                let _ = h.join();
            }
        });
    });
}

criterion_group!(benches, bench_get_hit, bench_put_with_eviction, bench_contended_get);
criterion_main!(benches);
