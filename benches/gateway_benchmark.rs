//! Benchmarks for the gateway's hot-path components.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgegate::cache::{cache_key, CachePolicy, ResponseCache};
use edgegate::circuit::{CircuitConfig, CircuitRegistry};
use edgegate::config::RouteClass;
use edgegate::ratelimit::{LimitPolicy, RateLimiter};
use edgegate::retry::RetryConfig;
use edgegate::store::MemoryStore;

fn bench_circuit_registry(c: &mut Criterion) {
    let registry = CircuitRegistry::new(CircuitConfig::default());
    registry.configure("bench", CircuitConfig::default());

    c.bench_function("circuit_allow", |b| {
        b.iter(|| black_box(registry.allow("bench").allowed));
    });

    c.bench_function("circuit_report_success", |b| {
        b.iter(|| registry.report("bench", black_box(true)));
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
    let policy = LimitPolicy::new(60_000, u64::MAX / 2);

    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));
    group.bench_function("should_limit", |b| {
        let limiter = Arc::clone(&limiter);
        b.to_async(&rt)
            .iter(|| async { black_box(limiter.should_limit("10.0.0.1", &policy).await.limited) });
    });
    group.finish();
}

fn bench_retry_math(c: &mut Criterion) {
    let config = RetryConfig::default().without_jitter();

    c.bench_function("retry_timeout_for", |b| {
        b.iter(|| black_box(config.timeout_for(black_box(3), Duration::from_secs(5))));
    });
}

fn bench_cache(c: &mut Criterion) {
    let cache = ResponseCache::new(10_000);
    let policy = CachePolicy::for_class(RouteClass::Content).unwrap();
    let key = cache_key("GET", "/api/content/posts", "page=1", "anonymous");
    cache.store(
        key.clone(),
        200,
        vec![("content-type".to_string(), "application/json".to_string())],
        &Bytes::from_static(b"{\"posts\":[]}"),
        &policy,
        vec![],
    );

    c.bench_function("cache_key_digest", |b| {
        b.iter(|| {
            black_box(cache_key(
                black_box("GET"),
                black_box("/api/content/posts"),
                black_box("page=1"),
                black_box("anonymous"),
            ))
        });
    });

    c.bench_function("cache_lookup_hit", |b| {
        b.iter(|| black_box(cache.lookup(&key).is_some()));
    });
}

criterion_group!(
    benches,
    bench_circuit_registry,
    bench_rate_limiter,
    bench_retry_math,
    bench_cache
);
criterion_main!(benches);
