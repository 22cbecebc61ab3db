mod common;

use common::*;
use cpusched::scheduler::Tunables;
use cpusched::SchedAttr;

fn short_quantum() -> Tunables {
    Tunables {
        rr_timeslice_ns: 3 * MS,
        ..Tunables::DEFAULT
    }
}

/// Ids of the tasks switched to, in order
fn switched_to(s: &Sim) -> Vec<u64> {
    s.platform().switches().iter().map(|&(_, next)| next).collect()
}

#[test]
fn test_round_robin_rotation() {
    let s = sim_with(1, short_quantum());
    let tasks: Vec<_> = (0..3).map(|i| spawn(&s, &format!("rr{}", i), SchedAttr::round_robin(10))).collect();
    s.schedule(0);

    // Three full rounds
    run_ticks(&s, 3 * 3 * 3, MS);

    let order = switched_to(&s);
    let expected: Vec<u64> = tasks.iter().map(|t| t.id()).cycle().take(order.len()).collect();
    assert!(order.len() >= 9, "only {} switches", order.len());
    assert_eq!(order, expected);
    for t in &tasks {
        assert_eq!(exec_ns(t), 9 * MS);
    }
}

#[test]
fn test_fifo_runs_until_it_stops() {
    let s = sim_with(1, short_quantum());
    let first = spawn(&s, "fifo-a", SchedAttr::fifo(10));
    let second = spawn(&s, "fifo-b", SchedAttr::fifo(10));
    s.schedule(0);
    run_ticks(&s, 50, MS);
    assert_eq!(current_id(&s, 0), first.id());
    assert_eq!(exec_ns(&second), 0);

    s.yield_current(0);
    assert_eq!(current_id(&s, 0), second.id());
}

#[test]
fn test_lower_priority_never_preempts() {
    let s = sim(1);
    let high = spawn(&s, "high", SchedAttr::fifo(5));
    s.schedule(0);
    assert_eq!(current_id(&s, 0), high.id());

    let low = spawn(&s, "low", SchedAttr::fifo(10));
    assert!(!s.need_resched(0));
    let same = spawn(&s, "same", SchedAttr::round_robin(5));
    assert!(!s.need_resched(0));

    let urgent = spawn(&s, "urgent", SchedAttr::fifo(1));
    assert!(s.need_resched(0));
    s.check_preempt(0);
    assert_eq!(current_id(&s, 0), urgent.id());

    // Highest non-empty level first, FIFO within a level
    s.exit_current(0);
    assert_eq!(current_id(&s, 0), high.id());
    s.exit_current(0);
    assert_eq!(current_id(&s, 0), same.id());
    s.exit_current(0);
    assert_eq!(current_id(&s, 0), low.id());
}

#[test]
fn test_realtime_starves_fair() {
    let s = sim(1);
    let fair = spawn(&s, "fair", SchedAttr::normal(-20));
    let rt = spawn(&s, "rt", SchedAttr::round_robin(50));
    s.schedule(0);
    run_ticks(&s, 500, MS);
    assert_eq!(exec_ns(&rt), 500 * MS);
    assert_eq!(exec_ns(&fair), 0);
}

#[test]
fn test_rr_interval_reported() {
    let s = sim_with(1, short_quantum());
    let rr = spawn(&s, "rr", SchedAttr::round_robin(1));
    let fifo = spawn(&s, "fifo", SchedAttr::fifo(1));
    assert_eq!(s.get_rr_interval(&rr).unwrap(), 3 * MS);
    assert_eq!(s.get_rr_interval(&fifo).unwrap(), 0);
}
