//! Integration tests for the semaphore and worker-pool bulkheads.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use breakwater::bulkhead::{Bulkhead, BulkheadConfig};
use breakwater::error::GuardError;
use breakwater::thread_pool_bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};

/// With one slot and a short wait, a second caller observes `BulkheadFull`
/// after roughly the wait time; once the holder completes, the next call
/// succeeds.
#[tokio::test(flavor = "multi_thread")]
async fn test_saturation_scenario() {
    let config = BulkheadConfig::builder()
        .max_concurrent_calls(1)
        .max_wait_time(Duration::from_millis(10))
        .build()
        .expect("valid config");
    let bh = Bulkhead::of("db", config);

    bh.acquire_permission().await.expect("slot");

    let started = Instant::now();
    let denied = bh.acquire_permission().await;
    assert!(matches!(denied, Err(GuardError::BulkheadFull { .. })));
    assert!(started.elapsed() >= Duration::from_millis(10));

    bh.on_complete();
    bh.acquire_permission().await.expect("released slot");
}

/// The number of concurrent permission holders never exceeds the cap.
#[tokio::test(flavor = "multi_thread")]
async fn test_concurrency_never_exceeds_cap() {
    let config = BulkheadConfig::builder()
        .max_concurrent_calls(3)
        .max_wait_time(Duration::from_secs(5))
        .build()
        .expect("valid config");
    let bh = Bulkhead::of("db", config);
    let inside = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));

    let tasks: Vec<_> = (0..24)
        .map(|_| {
            let bh = Arc::clone(&bh);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _: Result<(), GuardError<std::io::Error>> = bh
                    .execute(|| {
                        let inside = Arc::clone(&inside);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await;
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join");
    }

    assert!(peak.load(Ordering::SeqCst) <= 3, "peak {} exceeded cap", peak.load(Ordering::SeqCst));
    assert_eq!(inside.load(Ordering::SeqCst), 0);
    assert_eq!(bh.metrics().available_concurrent_calls, 3);
}

/// Pool bulkhead: run, queue, reject; nothing is silently discarded.
#[tokio::test]
async fn test_pool_run_queue_reject() {
    let config = ThreadPoolBulkheadConfig::builder()
        .core_thread_pool_size(1)
        .max_thread_pool_size(1)
        .queue_capacity(1)
        .build()
        .expect("valid config");
    let pool = ThreadPoolBulkhead::of("jobs", config);

    let (release, gate) = mpsc::channel::<()>();
    let running = pool
        .submit(move || {
            let _ = gate.recv();
            "ran"
        })
        .expect("accepted");
    std::thread::sleep(Duration::from_millis(30));

    let queued = pool.submit(|| "queued").expect("queued");
    let rejected = pool.submit(|| "rejected");
    assert!(matches!(rejected, Err(GuardError::BulkheadFull { .. })));

    release.send(()).expect("release");
    assert_eq!(running.join().await, Some("ran"));
    assert_eq!(queued.join().await, Some("queued"));
    pool.shutdown();
}

/// Pool shutdown completes the backlog before returning.
#[tokio::test]
async fn test_pool_shutdown_completes_backlog() {
    let config = ThreadPoolBulkheadConfig::builder()
        .core_thread_pool_size(2)
        .max_thread_pool_size(2)
        .queue_capacity(16)
        .build()
        .expect("valid config");
    let pool = ThreadPoolBulkhead::of("jobs", config);
    let done = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .expect("accepted")
        })
        .collect();

    pool.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    for handle in handles {
        assert_eq!(handle.join().await, Some(()));
    }
}
