//! Benchmarks for the hot permission paths.
//!
//! Covers the circuit breaker's acquire/record cycle, the rate limiter's
//! CAS loop and the semaphore bulkhead, in both uncontended and saturated
//! shapes.
//!
//! Run with: `cargo bench --bench primitives_bench -p breakwater`

use std::time::Duration;

use breakwater::bulkhead::{Bulkhead, BulkheadConfig};
use breakwater::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use breakwater::rate_limiter::{RateLimiter, RateLimiterConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("acquire_and_record_success", |b| {
        let breaker = CircuitBreaker::of_defaults("bench");
        b.iter(|| {
            assert!(breaker.try_acquire_permission());
            breaker.on_success(Duration::from_micros(50));
        });
    });

    group.bench_function("denied_while_forced_open", |b| {
        let breaker = CircuitBreaker::of_defaults("bench");
        breaker.transition_to_forced_open();
        b.iter(|| {
            black_box(breaker.try_acquire_permission());
        });
    });

    group.bench_function("metrics_snapshot", |b| {
        let config = CircuitBreakerConfig::builder()
            .ring_buffer_size_in_closed_state(100)
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::of("bench", config);
        for _ in 0..100 {
            breaker.on_success(Duration::from_micros(50));
        }
        b.iter(|| black_box(breaker.metrics()));
    });

    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    group.bench_function("reserve_granted", |b| {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1_000_000)
            .limit_refresh_period(Duration::from_millis(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid rate limiter config for benchmarks");
        let limiter = RateLimiter::of("bench", config);
        b.iter(|| black_box(limiter.reserve_permission()));
    });

    group.bench_function("reserve_refused", |b| {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(3600))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid rate limiter config for benchmarks");
        let limiter = RateLimiter::of("bench", config);
        assert!(limiter.try_acquire_permission());
        b.iter(|| black_box(limiter.reserve_permission()));
    });

    group.finish();
}

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");

    group.bench_function("try_acquire_release", |b| {
        let config = BulkheadConfig::builder()
            .max_concurrent_calls(64)
            .build()
            .expect("valid bulkhead config for benchmarks");
        let bulkhead = Bulkhead::of("bench", config);
        b.iter(|| {
            assert!(bulkhead.try_acquire_permission());
            bulkhead.on_complete();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_circuit_breaker, bench_rate_limiter, bench_bulkhead);
criterion_main!(benches);
