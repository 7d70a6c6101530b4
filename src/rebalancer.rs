//! Rebalancer: reacts to overload/offline/recovery by shedding, evacuating,
//! or migrating reservations (spec §4.7).

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus, ReleaseReason};
use crate::ledger::AllocationLedger;
use crate::scheduler::Scheduler;
use crate::types::{Priority, ReservationState, ServerId};

pub struct Rebalancer {
    ledger: Arc<AllocationLedger>,
    scheduler: Arc<Scheduler>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Rebalancer {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        scheduler: Arc<Scheduler>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            scheduler,
            event_bus,
            config,
        }
    }

    /// Migrate a single reservation: mark `Migrating`, attempt placement on a
    /// new server (excluding the source), commit or revert (spec §4.7).
    #[instrument(skip(self), fields(request_id = %reservation_id))]
    fn migrate_one(&self, reservation_id: &crate::types::RequestId, now_nanos: i64, source_offline: bool) {
        let Some(reservation) = self.ledger.get(reservation_id) else {
            return;
        };

        if self.ledger.mark(reservation_id, ReservationState::Migrating, now_nanos).is_err() {
            return;
        }

        match self.scheduler.plan_migration(&reservation) {
            Some(target) if target != reservation.server_id => {
                let draft = crate::ledger::ReservationDraft {
                    request_id: reservation.request_id.clone(),
                    agent_id: reservation.agent_id.clone(),
                    agent_type: reservation.agent_type.clone(),
                    server_id: target.clone(),
                    requested: reservation.requested.clone(),
                    granted: reservation.granted.clone(),
                    priority: reservation.priority,
                    qos_class: reservation.qos_class,
                };
                // The reservation keeps its request_id, so a plain commit would
                // just return the (still Migrating, same-server) reservation via
                // the idempotence path. Release the old binding first, then
                // commit fresh onto the target under a new id-scoped draft.
                let _ = self.ledger.release(reservation_id, ReleaseReason::Client);
                let relocated_id = format!("{}-migrated", reservation.request_id);
                let mut relocated_draft = draft;
                relocated_draft.request_id = relocated_id.clone().into();
                match self.ledger.commit(relocated_draft, now_nanos) {
                    Ok(_) => {
                        info!(%reservation_id, from = %reservation.server_id, to = %target, "reservation migrated");
                        self.event_bus.publish(EngineEvent::AgentMigrated {
                            agent_id: reservation.agent_id.to_string(),
                            from_server_id: reservation.server_id.clone(),
                            to_server_id: target,
                        });
                    }
                    Err(_) => {
                        warn!(%reservation_id, "migration commit failed after release");
                        self.event_bus.publish(EngineEvent::Released {
                            request_id: reservation_id.to_string(),
                            reason: ReleaseReason::MigrationFailed,
                        });
                    }
                }
            }
            _ => {
                if source_offline {
                    let _ = self.ledger.release(reservation_id, ReleaseReason::Evicted);
                    warn!(%reservation_id, "no placement found while source is offline, reservation evicted");
                    self.event_bus.publish(EngineEvent::Released {
                        request_id: reservation_id.to_string(),
                        reason: ReleaseReason::MigrationFailed,
                    });
                } else {
                    let _ = self.ledger.mark(reservation_id, ReservationState::Active, now_nanos);
                    warn!(%reservation_id, "no placement found, reverted to active on source");
                }
            }
        }
    }

    /// Server transitioned to `Overloaded`: shed up to
    /// `ceil(shedFraction * count)` of its lowest-priority reservations.
    #[instrument(skip(self))]
    pub fn shed_load(&self, server_id: &ServerId, now_nanos: i64) {
        let mut active: Vec<_> = self
            .ledger
            .list_by_server(server_id)
            .into_iter()
            .filter(|r| r.state == ReservationState::Active)
            .collect();

        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.granted.cpu_cores.partial_cmp(&a.granted.cpu_cores).unwrap())
        });

        let to_shed = (active.len() as f64 * self.config.rebalance_shed_fraction).ceil() as usize;
        info!(%server_id, to_shed, total = active.len(), "shedding load from overloaded server");

        for reservation in active.into_iter().take(to_shed) {
            self.migrate_one(&reservation.request_id, now_nanos, false);
        }
    }

    /// Server transitioned to `Offline`: evacuate every `Active` reservation,
    /// highest priority first.
    #[instrument(skip(self))]
    pub fn evacuate(&self, server_id: &ServerId, now_nanos: i64) {
        let mut active: Vec<_> = self
            .ledger
            .list_by_server(server_id)
            .into_iter()
            .filter(|r| r.state == ReservationState::Active)
            .collect();

        active.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!(%server_id, count = active.len(), "evacuating offline server");
        for reservation in active {
            self.migrate_one(&reservation.request_id, now_nanos, true);
        }
    }

    /// A server was added or recovered: give the queue a chance to drain into
    /// the newly available capacity.
    pub fn on_capacity_increase(&self, now_nanos: i64) {
        self.scheduler.drain_queue(now_nanos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::ledger::ReservationDraft;
    use crate::registry::{ServerRegistry, ServerReport};
    use crate::resource::{ResourceRequirement, ResourceVector};
    use crate::types::{QosClass, ServerStatus};

    fn setup() -> (Arc<ServerRegistry>, Arc<AllocationLedger>, Arc<Scheduler>, Rebalancer) {
        let bus = Arc::new(EventBus::new(64));
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), bus.clone()));
        let ledger = Arc::new(AllocationLedger::new(registry.clone(), bus.clone()));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            ledger.clone(),
            bus.clone(),
            EngineConfig::default(),
        ));
        let rebalancer = Rebalancer::new(ledger.clone(), scheduler.clone(), bus, EngineConfig::default());
        (registry, ledger, scheduler, rebalancer)
    }

    fn report(id: &str, cpu: f64) -> ServerReport {
        ServerReport {
            server_id: id.into(),
            timestamp_nanos: 1,
            resources: ResourceVector {
                cpu_cores: cpu,
                memory_total_bytes: 16_000_000_000,
                ..ResourceVector::zero()
            },
            reported_status: ServerStatus::Healthy,
        }
    }

    fn commit(ledger: &AllocationLedger, id: &str, server: &str, cpu: f64, priority: Priority) {
        ledger
            .commit(
                ReservationDraft {
                    request_id: id.into(),
                    agent_id: format!("agent-{id}").into(),
                    agent_type: "worker".into(),
                    server_id: server.into(),
                    requested: ResourceRequirement::default(),
                    granted: ResourceVector {
                        cpu_cores: cpu,
                        ..ResourceVector::zero()
                    },
                    priority,
                    qos_class: QosClass::Burstable,
                },
                1,
            )
            .unwrap();
    }

    #[test]
    fn shed_load_migrates_lowest_priority_reservations_first() {
        let (registry, ledger, _scheduler, rebalancer) = setup();
        registry.ingest_report(report("s1", 4.0)).unwrap();
        registry.ingest_report(report("s2", 4.0)).unwrap();

        commit(&ledger, "r1", "s1", 1.0, Priority::Low);
        commit(&ledger, "r2", "s1", 1.0, Priority::Low);
        commit(&ledger, "r3", "s1", 1.0, Priority::Normal);
        commit(&ledger, "r4", "s1", 1.0, Priority::Critical);

        rebalancer.shed_load(&"s1".into(), 10);

        let still_on_s1 = ledger.list_by_server(&"s1".into());
        let active_on_s1: Vec<_> = still_on_s1
            .iter()
            .filter(|r| r.state == ReservationState::Active)
            .collect();
        assert!(active_on_s1.iter().any(|r| r.priority == Priority::Critical));
        assert!(active_on_s1.iter().any(|r| r.priority == Priority::Normal));
    }

    #[test]
    fn evacuate_prioritizes_critical_reservations() {
        let (registry, ledger, _scheduler, rebalancer) = setup();
        registry.ingest_report(report("s1", 4.0)).unwrap();
        registry.ingest_report(report("s2", 1.0)).unwrap();

        commit(&ledger, "r1", "s1", 1.0, Priority::Critical);
        commit(&ledger, "r2", "s1", 1.0, Priority::Low);

        rebalancer.evacuate(&"s1".into(), 10);

        let on_s2 = ledger.list_by_server(&"s2".into());
        assert!(on_s2.iter().any(|r| r.agent_type == "worker" && r.state == ReservationState::Active));
    }
}
