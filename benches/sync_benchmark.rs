/*!
 * Synchronizer Benchmarks
 * Uncontended fast paths and delay-heap churn
 */

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use turnstile::{CoreConfig, Latch, Mutex, ScheduledCore, Semaphore};

fn benchmark_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex");

    let mutex = Mutex::new(0u64);
    group.bench_function("uncontended_lock_unlock", |b| {
        b.iter(|| {
            let mut guard = mutex.lock();
            *guard = black_box(*guard + 1);
        });
    });

    group.bench_function("contended_lock_unlock", |b| {
        b.iter_custom(|iters| {
            let mutex = Arc::new(Mutex::new(0u64));
            let stop = Arc::new(Latch::new());
            let background: Vec<_> = (0..2)
                .map(|_| {
                    let mutex = Arc::clone(&mutex);
                    let stop = Arc::clone(&stop);
                    thread::spawn(move || {
                        while !stop.is_open() {
                            *mutex.lock() += 1;
                        }
                    })
                })
                .collect();
            let start = std::time::Instant::now();
            for _ in 0..iters {
                *mutex.lock() += 1;
            }
            let elapsed = start.elapsed();
            stop.open();
            for handle in background {
                handle.join().unwrap();
            }
            elapsed
        });
    });

    group.finish();
}

fn benchmark_semaphore(c: &mut Criterion) {
    let sem = Semaphore::new(1);
    c.bench_function("semaphore_acquire_release", |b| {
        b.iter(|| {
            sem.acquire(1);
            sem.release(black_box(1));
        });
    });
}

fn benchmark_schedule_cancel(c: &mut Criterion) {
    let mut config = CoreConfig::default();
    config.remove_on_cancel = true;
    let core = ScheduledCore::new(config);
    c.bench_function("schedule_then_cancel", |b| {
        b.iter(|| {
            let future = core
                .schedule(|| {}, Duration::from_secs(60))
                .expect("core running");
            black_box(future.cancel(false));
        });
    });
}

criterion_group!(
    benches,
    benchmark_mutex,
    benchmark_semaphore,
    benchmark_schedule_cancel
);
criterion_main!(benches);
