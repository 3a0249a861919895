//! Performance benchmarks for envelope processing.
//!
//! These benchmarks measure the hot paths of a request:
//! - Sealing and opening envelopes of various sizes
//! - Opening envelopes that fail authentication
//! - Resolving addresses in the action registry

use std::sync::Arc;

use agent::modules::{self, ModuleContext};
use agent::packages::Unavailable;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{Address, EnvelopeCodec, Keyring, TrustLevel};
use tempfile::TempDir;

/// Two codecs that trust each other.
fn codecs(temp_dir: &TempDir) -> (EnvelopeCodec, EnvelopeCodec) {
    let agent = Arc::new(Keyring::new(temp_dir.path().join("agent")));
    let operator = Arc::new(Keyring::new(temp_dir.path().join("operator")));
    let agent_fp = agent.generate("web-01");
    let operator_fp = operator.generate("ops");
    agent
        .import(&operator.export(&operator_fp).unwrap(), TrustLevel::Trusted)
        .unwrap();
    operator
        .import(&agent.export(&agent_fp).unwrap(), TrustLevel::Trusted)
        .unwrap();
    (
        EnvelopeCodec::new(agent, agent_fp),
        EnvelopeCodec::new(operator, operator_fp),
    )
}

/// Benchmark sealing and opening envelopes.
fn bench_envelopes(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let (agent, operator) = codecs(&temp_dir);

    let mut group = c.benchmark_group("envelope");

    for (label, size) in [("small_64B", 64), ("medium_4KB", 4096), ("large_256KB", 262_144)] {
        let payload = serde_json::json!({
            "action": "packagemanagement.update",
            "parameters": { "blob": "x".repeat(size) },
        });
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("seal_{}", label), |b| {
            b.iter(|| operator.encode(black_box(&payload), &agent.local()).unwrap());
        });

        let sealed = operator.encode(&payload, &agent.local()).unwrap();
        group.bench_function(format!("open_{}", label), |b| {
            b.iter(|| {
                let envelope = agent.open(black_box(&sealed));
                black_box(envelope.authenticated_signer().unwrap())
            });
        });
    }

    // Rejection should be no slower than acceptance
    group.bench_function("open_garbage", |b| {
        let garbage = vec![0u8; 4096];
        b.iter(|| black_box(agent.open(black_box(&garbage))));
    });

    group.finish();
}

/// Benchmark address parsing and registry lookup.
fn bench_dispatch(c: &mut Criterion) {
    let registry = modules::registry(&ModuleContext {
        packages: Arc::new(Unavailable),
    })
    .unwrap();

    let mut group = c.benchmark_group("dispatch");

    group.bench_function("resolve_known", |b| {
        b.iter(|| {
            let address = Address::parse(black_box("packagemanagement.Refresh")).unwrap();
            black_box(registry.resolve(&address).is_ok())
        });
    });

    group.bench_function("resolve_unknown_module", |b| {
        b.iter(|| {
            let address = Address::parse(black_box("nomodule.x")).unwrap();
            black_box(registry.resolve(&address).is_err())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_envelopes, bench_dispatch);

criterion_main!(benches);
