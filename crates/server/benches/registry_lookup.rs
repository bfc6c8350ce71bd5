//! Performance benchmarks for registry lookups and path resolution.
//!
//! These benchmarks measure the hot paths hit on every request:
//! - Identity lookup by name and by source address
//! - Anonymous share resolution by hash
//! - Sandbox path cleaning

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use model::{GlobalConfig, ShareItem, UserConfig};
use server::{RegistryStore, Sandbox};

fn populated_store(identities: usize) -> (RegistryStore, Vec<String>) {
    let mut config = GlobalConfig::default();
    let mut hashes = Vec::with_capacity(identities);
    for i in 0..identities {
        let mut user = UserConfig::new(&format!("user{i}")).unwrap();
        user.ips = vec![IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i as u32))];
        let share = ShareItem::new(&format!("/public{i}"))
            .unwrap()
            .with_external(true);
        hashes.push(share.hash.clone());
        user.shares = vec![share];
        config.users.push(user);
    }
    let store = RegistryStore::with_config("/nonexistent/registry.json", config);
    (store, hashes)
}

/// Benchmark identity lookups against registry size.
fn bench_identity_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_lookup");

    for size in [10usize, 100, 1000] {
        let (store, _) = populated_store(size);
        let name = format!("USER{}", size / 2);
        let addr = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + (size / 2) as u32));

        group.bench_with_input(BenchmarkId::new("by_name", size), &name, |b, name| {
            b.iter(|| store.lookup_by_name(black_box(name)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("by_address", size), &addr, |b, addr| {
            b.iter(|| store.lookup_by_address(black_box(addr)).unwrap())
        });
    }

    group.finish();
}

/// Benchmark anonymous share resolution.
fn bench_share_hash_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("share_hash_lookup");

    for size in [10usize, 100, 1000] {
        let (store, hashes) = populated_store(size);
        let hash = hashes[size - 1].clone();
        group.bench_with_input(BenchmarkId::from_parameter(size), &hash, |b, hash| {
            b.iter(|| {
                store
                    .read(|state| server::shares::lookup_anonymous(state, black_box(hash)))
                    .unwrap()
            })
        });
    }

    group.finish();
}

/// Benchmark virtual path resolution.
fn bench_sandbox_resolve(c: &mut Criterion) {
    let sandbox = Sandbox::new(Path::new("/srv/homeshare/alice"));
    let mut group = c.benchmark_group("sandbox_resolve");

    group.bench_function("shallow", |b| {
        b.iter(|| sandbox.resolve(black_box("/docs/report.txt")))
    });
    group.bench_function("deep", |b| {
        b.iter(|| sandbox.resolve(black_box("/a/b/./c/../d/e/f/g/h/i/j/k.txt")))
    });
    group.bench_function("escape", |b| {
        b.iter(|| sandbox.resolve(black_box("/../../../etc/passwd")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_identity_lookup,
    bench_share_hash_lookup,
    bench_sandbox_resolve
);
criterion_main!(benches);
