use criterion::{
    criterion_group, criterion_main, measurement::WallTime, BenchmarkGroup, Criterion, Throughput,
};
use keybus_sharder::JumpHashDirectory;
use keybus_types::{DbNumber, PathKey, ShardChunkId, ShardDbInfo};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

fn get_random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn directory(num_buckets: u32) -> JumpHashDirectory {
    JumpHashDirectory::new((0..num_buckets).map(|i| ShardDbInfo {
        chunk: ShardChunkId::new(i),
        db: DbNumber::new(i % 16),
    }))
}

fn jumphash_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("jumphash");

    // Fixed binpath with a varying number of buckets.
    for num_buckets in [1_000, 10_000, 100_000, 1_000_000] {
        benchmark_scenario(
            &mut group,
            &format!("basic {num_buckets} buckets"),
            "C:/interface{name=eth0}/mtu",
            directory(num_buckets),
        );
    }

    // Long path keys to exercise hashing of large binpaths.
    let long = format!(
        "C:/{}/{}{{k={}}}",
        get_random_string(50),
        get_random_string(50),
        get_random_string(50),
    );
    benchmark_scenario(&mut group, "long path 10k buckets", &long, directory(10_000));

    group.finish();
}

fn benchmark_scenario(
    group: &mut BenchmarkGroup<'_, WallTime>,
    name: &str,
    path: &str,
    dir: JumpHashDirectory,
) {
    let binpath = path.parse::<PathKey>().unwrap().encode();

    group.throughput(Throughput::Elements(1));
    group.bench_function(name, |b| {
        b.iter(|| dir.shard_for(&binpath, b"bench-salt"));
    });
}

criterion_group!(benches, jumphash_benchmarks);
criterion_main!(benches);
