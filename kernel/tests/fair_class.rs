mod common;

use common::*;
use cpusched::scheduler::Tunables;
use cpusched::{SchedAttr, TaskState};

/// Microsecond-scale tunables so a 1 ms run spans many periods
fn scaled() -> Tunables {
    Tunables {
        sched_latency_ns: 24 * US,
        min_granularity_ns: 3 * US,
        wakeup_granularity_ns: US,
        tick_ns: US,
        ..Tunables::DEFAULT
    }
}

fn pct(part: u64, total: u64) -> f64 {
    part as f64 * 100.0 / total as f64
}

#[test]
fn test_three_task_weight_split() {
    let s = sim_with(1, scaled());
    let a = spawn(&s, "A", SchedAttr::normal(0));
    let b = spawn(&s, "B", SchedAttr::normal(0));
    let c = spawn(&s, "C", SchedAttr::normal(5));
    s.schedule(0);

    run_ticks(&s, 1000, US);

    let (ea, eb, ec) = (exec_ns(&a), exec_ns(&b), exec_ns(&c));
    let total = ea + eb + ec;
    assert_eq!(total, 1_000_000);

    let c_share = 335.0 * 100.0 / (1024.0 + 1024.0 + 335.0);
    assert!((pct(ea, total) - 40.0).abs() <= 5.0, "A got {:.1}%", pct(ea, total));
    assert!((pct(eb, total) - 40.0).abs() <= 5.0, "B got {:.1}%", pct(eb, total));
    assert!((pct(ec, total) - c_share).abs() <= 5.0, "C got {:.1}%", pct(ec, total));
}

#[test]
fn test_equal_tasks_converge() {
    let s = sim_with(1, scaled());
    let tasks: Vec<_> = (0..4).map(|i| spawn(&s, &format!("eq{}", i), SchedAttr::normal(0))).collect();
    s.schedule(0);

    let spread = |tasks: &[cpusched::TaskRef]| {
        let execs: Vec<u64> = tasks.iter().map(exec_ns).collect();
        execs.iter().max().unwrap() - execs.iter().min().unwrap()
    };

    // One slice plus a tick, with headroom
    let bound = scaled().sched_latency_ns / 2;
    for _ in 0..10 {
        run_ticks(&s, 200, US);
        assert!(spread(&tasks) <= bound, "spread {} ns", spread(&tasks));
    }
    let total: u64 = tasks.iter().map(exec_ns).sum();
    assert_eq!(total, 2_000 * US);
}

#[test]
fn test_nice_ratio_follows_weight_table() {
    let s = sim_with(1, scaled());
    let heavy = spawn(&s, "nice-5", SchedAttr::normal(-5));
    let light = spawn(&s, "nice0", SchedAttr::normal(0));
    s.schedule(0);

    run_ticks(&s, 20_000, US);

    let ratio = exec_ns(&heavy) as f64 / exec_ns(&light) as f64;
    let expected = 3121.0 / 1024.0;
    assert!((ratio - expected).abs() / expected < 0.1, "ratio {:.2}", ratio);
}

#[test]
fn test_sleeper_does_not_starve_others() {
    let s = sim_with(1, scaled());
    let hog = spawn(&s, "hog", SchedAttr::normal(0));
    let sleeper = spawn(&s, "sleeper", SchedAttr::normal(0));
    s.schedule(0);

    // Let the sleeper get on the CPU, then put it to sleep for a long time
    while current_id(&s, 0) != sleeper.id() {
        tick(&s, US);
    }
    s.sleep_current(0, TaskState::Interruptible).unwrap();
    assert_eq!(current_id(&s, 0), hog.id());
    run_ticks(&s, 500, US);

    let hog_before = exec_ns(&hog);
    s.wake_up_process(&sleeper);
    run_ticks(&s, 100, US);

    // Woken relative to min_vruntime: it shares the CPU rather than
    // monopolising it to make up for the sleep
    let hog_gain = exec_ns(&hog) - hog_before;
    assert!(hog_gain >= 30 * US, "hog only ran {} ns", hog_gain);
}

#[test]
fn test_yield_hands_cpu_over() {
    let s = sim(1);
    let a = spawn(&s, "a", SchedAttr::normal(0));
    let b = spawn(&s, "b", SchedAttr::normal(0));
    s.schedule(0);
    let first = current_id(&s, 0);
    s.yield_current(0);
    let second = current_id(&s, 0);
    assert_ne!(first, second);
    assert!([a.id(), b.id()].contains(&second));
}

#[test]
fn test_batch_and_idle_policies_run_as_fair() {
    let s = sim_with(1, scaled());
    let batch = spawn(&s, "batch", SchedAttr::batch(0));
    let idle = spawn(&s, "idleprio", SchedAttr::idle());
    s.schedule(0);
    run_ticks(&s, 1000, US);
    // SCHED_IDLE weight 3 against 1024
    assert!(exec_ns(&batch) > 50 * exec_ns(&idle));
    assert!(exec_ns(&idle) > 0);
}
