/*!
 * Scheduled Core Integration Tests
 *
 * Timing scenarios (fixed-rate, fixed-delay), cancellation, shutdown
 * policies and result plumbing. Timing tests are serialized and use
 * generous bounds to stay robust on loaded machines.
 */

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use pretty_assertions::assert_eq;
use serial_test::serial;

use turnstile::{CoreConfig, ScheduleError, ScheduledCore};

fn drain(core: ScheduledCore) {
    core.shutdown();
    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
}

#[test]
#[serial]
fn test_one_shot_runs_after_delay() {
    let core = ScheduledCore::new(CoreConfig::default());
    let start = Instant::now();
    let future = core
        .schedule_call(move || start.elapsed(), Duration::from_millis(80))
        .unwrap();

    let elapsed = future.get().unwrap();
    assert!(elapsed >= Duration::from_millis(75), "ran early: {elapsed:?}");
    assert!(future.is_done());
    assert!(!future.is_cancelled());
    drain(core);
}

#[test]
#[serial]
fn test_schedule_call_returns_value() {
    let core = ScheduledCore::new(CoreConfig::default());
    let future = core
        .schedule_call(|| 21 * 2, Duration::from_millis(10))
        .unwrap();
    assert_eq!(future.get(), Ok(42));
    drain(core);
}

#[test]
#[serial]
fn test_fifo_for_equal_trigger_times() {
    let core = ScheduledCore::new(CoreConfig::default());
    let order = Arc::new(PlMutex::new(Vec::new()));

    let mut futures = Vec::new();
    for id in 0..6u32 {
        let order = Arc::clone(&order);
        // Identical delays: sequence numbers must break the tie FIFO.
        futures.push(
            core.schedule(move || order.lock().push(id), Duration::from_millis(60))
                .unwrap(),
        );
    }
    for future in &futures {
        future.get().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    drain(core);
}

#[test]
#[serial]
fn test_fixed_rate_ignores_run_duration() {
    let core = ScheduledCore::new(CoreConfig::default());
    let starts = Arc::new(PlMutex::new(Vec::new()));
    let origin = Instant::now();

    let starts_clone = Arc::clone(&starts);
    let future = core
        .schedule_at_fixed_rate(
            move || {
                starts_clone.lock().push(origin.elapsed());
                // Work shorter than the period must not shift the grid.
                thread::sleep(Duration::from_millis(30));
            },
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(480));
    future.cancel(false);
    let starts = starts.lock().clone();
    assert!(starts.len() >= 4, "expected ≥4 runs, got {starts:?}");
    for (i, start) in starts.iter().take(4).enumerate() {
        let expected = Duration::from_millis(100 * (i as u64 + 1));
        assert!(
            *start >= expected - Duration::from_millis(20)
                && *start <= expected + Duration::from_millis(70),
            "run {i} at {start:?}, expected ≈{expected:?}"
        );
    }
    drain(core);
}

#[test]
#[serial]
fn test_fixed_delay_measures_from_completion() {
    let core = ScheduledCore::new(CoreConfig::default());
    let starts = Arc::new(PlMutex::new(Vec::new()));
    let origin = Instant::now();

    let starts_clone = Arc::clone(&starts);
    let future = core
        .schedule_with_fixed_delay(
            move || {
                starts_clone.lock().push(origin.elapsed());
                thread::sleep(Duration::from_millis(50));
            },
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();

    // Period is delay + run duration ≈ 150 ms: starts ≈ 100, 250, 400.
    thread::sleep(Duration::from_millis(500));
    future.cancel(false);
    let starts = starts.lock().clone();
    assert!(starts.len() >= 3, "expected ≥3 runs, got {starts:?}");
    let expected = [100u64, 250, 400];
    for (i, expected_ms) in expected.iter().enumerate() {
        let expected = Duration::from_millis(*expected_ms);
        let start = starts[i];
        assert!(
            start >= expected - Duration::from_millis(20)
                && start <= expected + Duration::from_millis(90),
            "run {i} at {start:?}, expected ≈{expected:?}"
        );
    }
    drain(core);
}

#[test]
#[serial]
fn test_periodic_runs_never_overlap() {
    let core = ScheduledCore::new(CoreConfig::with_core_threads(4));
    let running = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let future = {
        let running = Arc::clone(&running);
        let overlapped = Arc::clone(&overlapped);
        let runs = Arc::clone(&runs);
        core.schedule_at_fixed_rate(
            move || {
                if running.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                // Run longer than the period to force backlog pressure.
                thread::sleep(Duration::from_millis(30));
                running.store(false, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .unwrap()
    };

    thread::sleep(Duration::from_millis(300));
    future.cancel(false);
    assert!(runs.load(Ordering::SeqCst) >= 3);
    assert!(!overlapped.load(Ordering::SeqCst), "periodic runs overlapped");
    drain(core);
}

#[test]
#[serial]
fn test_cancel_before_trigger_never_runs() {
    let core = ScheduledCore::new(CoreConfig::default());
    let ran = Arc::new(AtomicBool::new(false));

    let ran_clone = Arc::clone(&ran);
    let future = core
        .schedule(
            move || ran_clone.store(true, Ordering::SeqCst),
            Duration::from_secs(10),
        )
        .unwrap();

    assert!(future.cancel(false));
    assert!(future.is_cancelled());
    assert_eq!(future.get(), Err(ScheduleError::Cancelled));
    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
    drain(core);
}

#[test]
#[serial]
fn test_cancel_with_removal_shrinks_queue() {
    let mut config = CoreConfig::default();
    config.remove_on_cancel = true;
    let core = ScheduledCore::new(config);

    let keeper = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    let before = core.queue_len();
    let victim = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    assert_eq!(core.queue_len(), before + 1);

    assert!(victim.cancel(false));
    // Eager removal: heap returns to its prior size immediately.
    assert_eq!(core.queue_len(), before);

    assert!(keeper.cancel(false));
    drain(core);
}

#[test]
#[serial]
fn test_cancel_without_removal_leaves_entry() {
    let core = ScheduledCore::new(CoreConfig::default());
    assert!(!core.remove_on_cancel());

    let victim = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    let before = core.queue_len();
    assert!(victim.cancel(false));
    // Lazy mode: the cancelled entry stays until polled or swept.
    assert_eq!(core.queue_len(), before);
    drain(core);
}

#[test]
#[serial]
fn test_shutdown_cancels_periodic_keeps_delayed() {
    let core = ScheduledCore::new(CoreConfig::default());
    let delayed_ran = Arc::new(AtomicBool::new(false));

    let periodic = core
        .schedule_at_fixed_rate(|| {}, Duration::from_secs(5), Duration::from_secs(5))
        .unwrap();
    let delayed_clone = Arc::clone(&delayed_ran);
    let delayed = core
        .schedule(
            move || delayed_clone.store(true, Ordering::SeqCst),
            Duration::from_millis(80),
        )
        .unwrap();

    core.shutdown();
    assert!(core.is_shutdown());
    // continue_periodic_after_shutdown=false: periodic is cancelled
    // and removed by the policy sweep.
    assert!(periodic.is_cancelled());
    // execute_delayed_after_shutdown=true: the one-shot still runs.
    delayed.get().unwrap();
    assert!(delayed_ran.load(Ordering::SeqCst));

    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
    assert!(core.is_terminated());
}

#[test]
#[serial]
fn test_shutdown_drops_delayed_when_disallowed() {
    let mut config = CoreConfig::default();
    config.execute_delayed_after_shutdown = false;
    let core = ScheduledCore::new(config);
    let ran = Arc::new(AtomicBool::new(false));

    let ran_clone = Arc::clone(&ran);
    let future = core
        .schedule(
            move || ran_clone.store(true, Ordering::SeqCst),
            Duration::from_millis(100),
        )
        .unwrap();

    core.shutdown();
    assert!(future.is_cancelled());
    assert_eq!(core.queue_len(), 0);
    thread::sleep(Duration::from_millis(200));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
}

#[test]
#[serial]
fn test_submission_after_shutdown_is_rejected() {
    let core = ScheduledCore::new(CoreConfig::default());
    core.shutdown();
    let result = core.schedule(|| {}, Duration::from_millis(10));
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));
    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
}

#[test]
#[serial]
fn test_shutdown_now_returns_unrun_tasks() {
    let core = ScheduledCore::new(CoreConfig::default());
    let _a = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    let _b = core.schedule(|| {}, Duration::from_secs(10)).unwrap();

    let unrun = core.shutdown_now();
    assert_eq!(unrun.len(), 2);
    assert_eq!(core.queue_len(), 0);
    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
}

#[test]
#[serial]
fn test_panicking_task_reports_and_stops() {
    let core = ScheduledCore::new(CoreConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let runs_clone = Arc::clone(&runs);
    let periodic = core
        .schedule_at_fixed_rate(
            move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            },
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
        .unwrap();

    // A panicking periodic task must not reschedule.
    let result = periodic.get();
    assert!(matches!(result, Err(ScheduleError::Panicked(ref m)) if m.contains("boom")));
    thread::sleep(Duration::from_millis(120));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    drain(core);
}

#[test]
#[serial]
fn test_get_timeout_on_pending_task() {
    let core = ScheduledCore::new(CoreConfig::default());
    let future = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    assert_eq!(future.get_timeout(Duration::from_millis(50)), Ok(None));
    assert!(future.cancel(false));
    drain(core);
}

#[test]
#[serial]
fn test_invalid_period_is_rejected() {
    let core = ScheduledCore::new(CoreConfig::default());
    assert!(matches!(
        core.schedule_at_fixed_rate(|| {}, Duration::ZERO, Duration::ZERO),
        Err(ScheduleError::InvalidPeriod(_))
    ));
    assert!(matches!(
        core.schedule_with_fixed_delay(|| {}, Duration::ZERO, Duration::ZERO),
        Err(ScheduleError::InvalidPeriod(_))
    ));
    drain(core);
}

#[test]
#[serial]
fn test_delay_is_visible_on_future() {
    let core = ScheduledCore::new(CoreConfig::default());
    let future = core.schedule(|| {}, Duration::from_secs(10)).unwrap();
    let delay = future.delay();
    assert!(delay > Duration::from_secs(9));
    assert!(delay <= Duration::from_secs(10));
    assert!(future.cancel(false));
    drain(core);
}

#[test]
#[serial]
fn test_queue_snapshot_is_read_mostly() {
    let core = ScheduledCore::new(CoreConfig::default());
    let _a = core.schedule(|| {}, Duration::from_secs(8)).unwrap();
    let _b = core.schedule(|| {}, Duration::from_secs(9)).unwrap();
    let snapshot = core.queue_snapshot();
    assert_eq!(snapshot.len(), 2);
    for task in &snapshot {
        assert!(!task.is_periodic());
        assert!(task.delay_nanos() > 0);
    }
    core.shutdown_now();
    assert!(core.await_termination(Duration::from_secs(5)).unwrap());
}

#[test]
#[serial]
fn test_multi_worker_parallel_one_shots() {
    let core = ScheduledCore::new(CoreConfig::with_core_threads(4));
    let started = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..4)
        .map(|_| {
            let started = Arc::clone(&started);
            core.schedule(
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                },
                Duration::from_millis(10),
            )
            .unwrap()
        })
        .collect();

    // With four workers the overlapping sleeps finish well under the
    // serialized 600 ms.
    let start = Instant::now();
    for future in &futures {
        future.get().unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(started.load(Ordering::SeqCst), 4);
    drain(core);
}
