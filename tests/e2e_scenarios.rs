//! End-to-end scenarios from the spec's testable-properties section: these
//! need several components wired together and don't fit inside one module.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_scheduler::{
    AllocationLedger, AllocationOutcome, AllocationRequest, EngineConfig, EventBus, Priority,
    QosClass, Rebalancer, ResourceAmount, ResourceRequirement, ResourceVector, Scheduler,
    ServerRegistry, ServerReport, ServerStatus,
};

struct Harness {
    registry: Arc<ServerRegistry>,
    ledger: Arc<AllocationLedger>,
    scheduler: Arc<Scheduler>,
    rebalancer: Rebalancer,
}

fn harness() -> Harness {
    let bus = Arc::new(EventBus::new(256));
    let config = EngineConfig::default();
    let registry = Arc::new(ServerRegistry::new(config.clone(), bus.clone()));
    let ledger = Arc::new(AllocationLedger::new(registry.clone(), bus.clone()));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        ledger.clone(),
        bus.clone(),
        config.clone(),
    ));
    let rebalancer = Rebalancer::new(ledger.clone(), scheduler.clone(), bus, config);
    Harness {
        registry,
        ledger,
        scheduler,
        rebalancer,
    }
}

fn report(server_id: &str, cpu_cores: f64, cpu_pct: f64, mem_total: u64, mem_used: u64) -> ServerReport {
    ServerReport {
        server_id: server_id.into(),
        timestamp_nanos: 1,
        resources: ResourceVector {
            cpu_cores,
            cpu_usage_percent: cpu_pct,
            memory_total_bytes: mem_total,
            memory_used_bytes: mem_used,
            ..ResourceVector::zero()
        },
        reported_status: ServerStatus::Healthy,
    }
}

fn request(id: &str, cpu: f64, mem: u64, priority: Priority) -> AllocationRequest {
    AllocationRequest {
        request_id: id.into(),
        agent_id: format!("agent-{id}").into(),
        agent_type: "worker".into(),
        requester: format!("agent-{id}"),
        requested: ResourceRequirement {
            minimum: ResourceAmount {
                cpu_cores: cpu,
                memory_bytes: mem,
                ..Default::default()
            },
            preferred: ResourceAmount {
                cpu_cores: cpu,
                memory_bytes: mem,
                ..Default::default()
            },
        },
        priority,
        qos_class: QosClass::Burstable,
        preferred_servers: BTreeSet::new(),
        excluded_servers: BTreeSet::new(),
        max_queue_wait_nanos: 0,
        deadline_nanos: None,
    }
}

/// Scenario 1: basic placement.
#[test]
fn basic_placement() {
    let h = harness();
    h.registry
        .ingest_report(report("s1", 8.0, 20.0, 16_000_000_000, 4_000_000_000))
        .unwrap();

    let outcome = h
        .scheduler
        .allocate(request("r1", 2.0, 2_000_000_000, Priority::Normal), 10)
        .unwrap();

    let AllocationOutcome::Committed(reservation) = outcome else {
        panic!("expected commit");
    };
    assert_eq!(reservation.server_id.to_string(), "s1");
    assert_eq!(reservation.granted.cpu_cores, 2.0);
    assert_eq!(h.ledger.committed_on(&"s1".into()).cpu_cores, 2.0);
}

/// Scenario 2: capacity exhaustion then queue drain on release.
#[test]
fn capacity_exhaustion_then_queue_drain() {
    let h = harness();
    h.registry
        .ingest_report(report("s1", 4.0, 0.0, 4_000_000_000, 0))
        .unwrap();

    for i in 0..3 {
        let outcome = h
            .scheduler
            .allocate(request(&format!("r{i}"), 1.0, 1_000_000_000, Priority::Normal), 10)
            .unwrap();
        assert!(matches!(outcome, AllocationOutcome::Committed(_)));
    }

    let mut fourth = request("r3", 2.0, 2_000_000_000, Priority::Normal);
    fourth.max_queue_wait_nanos = 60_000_000_000;
    let outcome = h.scheduler.allocate(fourth, 11).unwrap();
    assert!(matches!(outcome, AllocationOutcome::Queued { position: 1, .. }));

    assert!(h.scheduler.release(&"r0".into()).unwrap());
    h.scheduler.drain_queue(12);
    assert_eq!(h.scheduler.queued_len(), 0);
    assert!(h.ledger.get(&"r3".into()).is_some());
}

/// Scenario 3: overload shedding sheds the lowest-priority reservations.
#[test]
fn overload_shedding_moves_low_priority_reservations() {
    let h = harness();
    h.registry.ingest_report(report("s1", 4.0, 20.0, 8_000_000_000, 0)).unwrap();
    h.registry.ingest_report(report("s2", 4.0, 20.0, 8_000_000_000, 0)).unwrap();

    h.scheduler.allocate(request("low1", 0.5, 100_000_000, Priority::Low), 1).unwrap();
    h.scheduler.allocate(request("low2", 0.5, 100_000_000, Priority::Low), 1).unwrap();
    h.scheduler.allocate(request("normal1", 0.5, 100_000_000, Priority::Normal), 1).unwrap();
    h.scheduler.allocate(request("crit1", 0.5, 100_000_000, Priority::Critical), 1).unwrap();

    // Push s1 into Overloaded via a fresh high-CPU report.
    h.registry
        .ingest_report(report("s1", 4.0, 95.0, 8_000_000_000, 0))
        .unwrap();

    h.rebalancer.shed_load(&"s1".into(), 20);

    let on_s1 = h.ledger.list_by_server(&"s1".into());
    let active_on_s1: Vec<_> = on_s1
        .iter()
        .filter(|r| r.state == fleet_scheduler::ReservationState::Active)
        .collect();
    assert!(active_on_s1.iter().any(|r| r.request_id.to_string() == "crit1"));
    assert!(active_on_s1.iter().any(|r| r.request_id.to_string() == "normal1"));
    assert!(!active_on_s1.iter().any(|r| r.request_id.to_string() == "low1"));
    assert!(!active_on_s1.iter().any(|r| r.request_id.to_string() == "low2"));
}

/// Scenario 4: offline evacuation prioritizes higher-priority reservations.
#[test]
fn offline_evacuation_prioritizes_critical_over_besteffort() {
    let h = harness();
    h.registry.ingest_report(report("s1", 2.0, 10.0, 2_000_000_000, 0)).unwrap();
    h.registry.ingest_report(report("s2", 1.0, 10.0, 1_000_000_000, 0)).unwrap();

    h.scheduler.allocate(request("crit", 1.0, 500_000_000, Priority::Critical), 1).unwrap();
    h.scheduler.allocate(request("best", 1.0, 500_000_000, Priority::Low), 1).unwrap();

    h.rebalancer.evacuate(&"s1".into(), 10);

    let on_s2 = h.ledger.list_by_server(&"s2".into());
    assert!(on_s2
        .iter()
        .any(|r| r.priority == Priority::Critical && r.state == fleet_scheduler::ReservationState::Active));

    let best_effort = h.ledger.get(&"best".into()).unwrap();
    assert_eq!(best_effort.state, fleet_scheduler::ReservationState::Released);
}

/// Scenario 5: deterministic tie-break picks the lexicographically smaller id.
#[test]
fn deterministic_tie_break_on_identical_servers() {
    let h = harness();
    h.registry.ingest_report(report("s2", 8.0, 20.0, 16_000_000_000, 0)).unwrap();
    h.registry.ingest_report(report("s1", 8.0, 20.0, 16_000_000_000, 0)).unwrap();

    for attempt in 0..2 {
        let outcome = h
            .scheduler
            .allocate(
                request(&format!("r{attempt}"), 1.0, 1_000_000_000, Priority::Normal),
                10 + attempt,
            )
            .unwrap();
        let AllocationOutcome::Committed(reservation) = outcome else {
            panic!("expected commit");
        };
        assert_eq!(reservation.server_id.to_string(), "s1");
        h.scheduler.release(&format!("r{attempt}").into()).unwrap();
    }
}

/// Scenario 6: cancelling a queued request removes it without ever
/// committing.
#[test]
fn cancellation_race_never_commits() {
    let h = harness();
    h.registry.ingest_report(report("s1", 1.0, 0.0, 1_000_000_000, 0)).unwrap();

    h.scheduler.allocate(request("r0", 1.0, 1_000_000_000, Priority::Normal), 1).unwrap();

    let mut queued = request("r1", 1.0, 1_000_000_000, Priority::Normal);
    queued.max_queue_wait_nanos = 60_000_000_000;
    let outcome = h.scheduler.allocate(queued, 2).unwrap();
    assert!(matches!(outcome, AllocationOutcome::Queued { .. }));

    assert!(h.scheduler.cancel_queued(&"r1".into()));
    assert_eq!(h.scheduler.queued_len(), 0);
    assert!(h.ledger.get(&"r1".into()).is_none());
}
