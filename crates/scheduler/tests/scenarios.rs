//! End-to-end scheduling scenarios driven by the simulated host.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanesched_scheduler::sim::SimulatedHost;
use lanesched_scheduler::{
    Priority, PumpPolicy, TaskQueue, TaskQueueManager, TaskQueueSpec, TimeDomainKind,
};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn record(log: &Log, label: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(label)
}

fn entries(log: &Log) -> Vec<&'static str> {
    log.lock().unwrap().clone()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn manager() -> (Arc<SimulatedHost>, TaskQueueManager) {
    let host = SimulatedHost::new();
    let manager = TaskQueueManager::with_defaults(host.clone());
    (host, manager)
}

fn queue(manager: &TaskQueueManager, spec: TaskQueueSpec) -> TaskQueue {
    manager.new_task_queue(spec).unwrap()
}

#[test]
fn single_queue_is_fifo() {
    let (host, manager) = manager();
    let q = queue(&manager, TaskQueueSpec::new("q"));
    let log = Log::default();
    for label in ["t1", "t2", "t3", "t4"] {
        q.post_task("test", record(&log, label));
    }
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["t1", "t2", "t3", "t4"]);
}

#[test]
fn control_preempts_normal_then_fifo_within_tier() {
    let (host, manager) = manager();
    let q1 = queue(&manager, TaskQueueSpec::new("q1"));
    let q2 = queue(&manager, TaskQueueSpec::new("q2").with_priority(Priority::Control));
    let log = Log::default();

    q1.post_task("test", record(&log, "t1"));
    q2.post_task("test", record(&log, "t3"));
    q1.post_task("test", record(&log, "t2"));

    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["t3", "t1", "t2"]);
}

#[test]
fn manual_queue_is_invisible_until_pumped() {
    let (host, manager) = manager();
    let manual = queue(&manager, TaskQueueSpec::new("manual").with_pump_policy(PumpPolicy::Manual));
    let other = queue(&manager, TaskQueueSpec::new("other"));
    let log = Log::default();
    for label in ["m1", "m2", "m3", "m4", "m5"] {
        manual.post_task("test", record(&log, label));
    }
    other.post_task("test", record(&log, "other"));

    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["other"]);
    assert_eq!(manual.number_of_pending_tasks(), 5);

    assert!(manual.pump(true));
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["other", "m1", "m2", "m3", "m4", "m5"]);

    let callbacks_before = host.num_pending_callbacks();
    assert!(!manual.pump(true));
    assert_eq!(host.num_pending_callbacks(), callbacks_before, "empty pump requests no pass");
}

#[test]
fn virtual_time_promotes_only_due_tasks() {
    let (host, manager) = manager();
    let start = host.now();
    let domain = manager
        .register_time_domain("virtual", TimeDomainKind::Virtual { start })
        .unwrap();
    let q = queue(&manager, TaskQueueSpec::new("q").with_time_domain(domain));
    let log = Log::default();

    q.post_delayed_task("test", record(&log, "d1"), ms(100));
    q.post_delayed_task("test", record(&log, "d2"), ms(50));
    assert_eq!(host.num_pending_callbacks(), 0, "virtual domains never ask the host");

    manager.advance_virtual_time(domain, start + ms(60)).unwrap();
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["d2"]);

    manager.advance_virtual_time(domain, start + ms(150)).unwrap();
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["d2", "d1"]);
}

#[test]
fn virtual_time_cannot_go_backwards() {
    let (host, manager) = manager();
    let start = host.now();
    let domain = manager
        .register_time_domain("virtual", TimeDomainKind::Virtual { start })
        .unwrap();
    manager.advance_virtual_time(domain, start + ms(10)).unwrap();
    assert!(manager.advance_virtual_time(domain, start).is_err());
    assert!(manager
        .advance_virtual_time(manager.real_time_domain(), start + ms(20))
        .is_err());
}

#[test]
fn migration_keeps_relative_order_and_remaining_delay() {
    let (host, manager) = manager();
    let start = host.now();
    let domain = manager
        .register_time_domain("virtual", TimeDomainKind::Virtual { start })
        .unwrap();
    let q = queue(&manager, TaskQueueSpec::new("q"));
    let log = Log::default();

    q.post_delayed_task("test", record(&log, "late"), ms(40));
    q.post_delayed_task("test", record(&log, "early"), ms(20));
    host.advance(ms(5));

    q.set_time_domain(domain).unwrap();
    assert_eq!(q.time_domain(), domain);
    assert_eq!(q.next_delayed_run_time(), Some(start + ms(15)));
    assert!(manager.unregister_time_domain(domain).is_err(), "domain is in use");

    // The real clock no longer matters for this queue.
    host.advance(ms(100));
    host.run_until_idle(&manager);
    assert!(entries(&log).is_empty());

    manager.advance_virtual_time(domain, start + ms(15)).unwrap();
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["early"]);

    manager.advance_virtual_time(domain, start + ms(35)).unwrap();
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["early", "late"]);

    q.set_time_domain(manager.real_time_domain()).unwrap();
    manager.unregister_time_domain(domain).unwrap();
}

#[test]
fn elapsed_due_time_runs_on_next_pass() {
    let (host, manager) = manager();
    let start = host.now();
    let domain = manager
        .register_time_domain("virtual", TimeDomainKind::Virtual { start })
        .unwrap();
    let q = queue(&manager, TaskQueueSpec::new("q").with_time_domain(domain));
    let log = Log::default();

    q.post_delayed_task("test", record(&log, "due"), ms(1));
    manager.advance_virtual_time(domain, start + ms(1)).unwrap();
    q.post_delayed_task("test", record(&log, "zero"), Duration::ZERO);
    host.run_until_idle(&manager);
    assert_eq!(entries(&log), vec!["due", "zero"]);
}

#[test]
fn sustained_high_priority_load_still_serves_best_effort() {
    let (host, manager) = manager();
    let high = queue(&manager, TaskQueueSpec::new("high").with_priority(Priority::High));
    let low = queue(&manager, TaskQueueSpec::new("low").with_priority(Priority::BestEffort));
    let log = Log::default();

    low.post_task("test", record(&log, "low"));
    for _ in 0..20 {
        high.post_task("test", record(&log, "high"));
    }
    host.run_until_idle(&manager);

    let position = entries(&log).iter().position(|l| *l == "low").unwrap();
    assert_eq!(position, 5, "default threshold serves the starved tier after five selections");
    assert_eq!(manager.metrics().starvation_forced_selections, 1);
}

#[test]
fn metrics_report_serializes() {
    let (host, manager) = manager();
    let q = queue(&manager, TaskQueueSpec::new("reported"));
    q.post_task("test", || {});
    host.run_until_idle(&manager);

    let metrics = manager.metrics();
    assert_eq!(metrics.total_executed(), 1);
    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["tasks_executed"]["reported"], 1);
}
