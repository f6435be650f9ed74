use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use predstore::collection::into_collection;
use predstore::{CacheStore, CollectionName, FileStore};
use rand::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn put_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_bench");
    group.bench_function("guesses", |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let cache = CacheStore::new(FileStore::open(temp_dir.path()).unwrap());
                (cache, temp_dir)
            },
            |(cache, _temp_dir)| {
                for i in 1..(1 << 6) {
                    let delta = into_collection(json!({
                        format!("client{}", i): {"cs-f111": {"midsem": i}}
                    }))
                    .unwrap();
                    cache.put(CollectionName::Guesses, delta).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn get_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_bench");
    for i in &vec![6, 8, 10] {
        group.bench_with_input(format!("guesses_{}", i), i, |b, i| {
            let temp_dir = TempDir::new().unwrap();
            let cache = CacheStore::new(FileStore::open(temp_dir.path()).unwrap());
            for key_i in 1..(1 << i) {
                let delta = into_collection(json!({
                    format!("client{}", key_i): {"cs-f111": {"midsem": key_i}}
                }))
                .unwrap();
                cache.put(CollectionName::Users, delta).unwrap();
            }
            let mut rng = SmallRng::from_seed([0; 32]);
            b.iter(|| {
                let users = cache.get(CollectionName::Users);
                let key = format!("client{}", rng.gen_range(1..(1 << i)));
                assert!(users.contains_key(&key));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, put_bench, get_bench);
criterion_main!(benches);
