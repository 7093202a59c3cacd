use std::hint::black_box;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use criterion::Throughput;
use hashbrown::HashMap as HashbrownMap;
use robin_dict::DictOrder;
use robin_dict::Dictionary;
use robin_dict::HashKey;

const SIZES: &[usize] = &[1 << 10, 1 << 14, 1 << 18];

fn keys(size: usize) -> Vec<(Vec<u8>, u64)> {
    (0..size)
        .map(|i| {
            let bytes = format!("key_{}", i).into_bytes();
            let hash = HashKey::hash_of(&bytes);
            black_box((bytes, hash))
        })
        .collect()
}

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for &size in SIZES {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("robin_dict/{}", size), |b| {
            b.iter(|| {
                let mut dict: Dictionary<u64> = Dictionary::new(DictOrder::Unordered);
                for (i, (bytes, hash)) in keys.iter().enumerate() {
                    dict.insert(bytes, *hash, i as u64, None);
                }
                black_box(dict.len())
            });
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut map: HashbrownMap<Vec<u8>, u64> = HashbrownMap::new();
                for (i, (bytes, _)) in keys.iter().enumerate() {
                    map.insert(bytes.clone(), i as u64);
                }
                black_box(map.len())
            });
        });
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for &size in SIZES {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        let mut dict: Dictionary<u64> = Dictionary::new(DictOrder::Unordered);
        let mut map: HashbrownMap<Vec<u8>, u64> = HashbrownMap::new();
        for (i, (bytes, hash)) in keys.iter().enumerate() {
            dict.insert(bytes, *hash, i as u64, None);
            map.insert(bytes.clone(), i as u64);
        }

        group.bench_function(format!("robin_dict/{}", size), |b| {
            b.iter(|| {
                let mut sum = 0u64;
                for (bytes, hash) in keys.iter() {
                    sum = sum.wrapping_add(*dict.lookup(bytes, *hash).unwrap());
                }
                black_box(sum)
            });
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut sum = 0u64;
                for (bytes, _) in keys.iter() {
                    sum = sum.wrapping_add(*map.get(bytes).unwrap());
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_lookup_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_miss");

    for &size in SIZES {
        let present = keys(size);
        let absent: Vec<(Vec<u8>, u64)> = (0..size)
            .map(|i| {
                let bytes = format!("missing_{}", i).into_bytes();
                let hash = HashKey::hash_of(&bytes);
                (bytes, hash)
            })
            .collect();
        group.throughput(Throughput::Elements(size as u64));

        let mut dict: Dictionary<u64> = Dictionary::new(DictOrder::Unordered);
        let mut map: HashbrownMap<Vec<u8>, u64> = HashbrownMap::new();
        for (i, (bytes, hash)) in present.iter().enumerate() {
            dict.insert(bytes, *hash, i as u64, None);
            map.insert(bytes.clone(), i as u64);
        }

        group.bench_function(format!("robin_dict/{}", size), |b| {
            b.iter(|| {
                let mut misses = 0usize;
                for (bytes, hash) in absent.iter() {
                    if dict.lookup(bytes, *hash).is_none() {
                        misses += 1;
                    }
                }
                black_box(misses)
            });
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut misses = 0usize;
                for (bytes, _) in absent.iter() {
                    if map.get(bytes).is_none() {
                        misses += 1;
                    }
                }
                black_box(misses)
            });
        });
    }

    group.finish();
}

fn bench_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove");

    for &size in SIZES {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("robin_dict/{}", size), |b| {
            b.iter_batched(
                || {
                    let mut dict: Dictionary<u64> = Dictionary::new(DictOrder::Unordered);
                    for (i, (bytes, hash)) in keys.iter().enumerate() {
                        dict.insert(bytes, *hash, i as u64, None);
                    }
                    dict
                },
                |mut dict| {
                    for (bytes, hash) in keys.iter() {
                        black_box(dict.remove(bytes, *hash, None));
                    }
                    dict
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter_batched(
                || {
                    let mut map: HashbrownMap<Vec<u8>, u64> = HashbrownMap::new();
                    for (i, (bytes, _)) in keys.iter().enumerate() {
                        map.insert(bytes.clone(), i as u64);
                    }
                    map
                },
                |mut map| {
                    for (bytes, _) in keys.iter() {
                        black_box(map.remove(bytes));
                    }
                    map
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_lookup_hit,
    bench_lookup_miss,
    bench_remove
);
criterion_main!(benches);
