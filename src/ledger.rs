//! Allocation ledger: `requestId → Reservation` plus the per-server committed
//! rollup (spec §4.3).
//!
//! Lock ordering mirrors spec §5: a ledger-wide `parking_lot::Mutex` guards
//! the `requestId` uniqueness check and the capacity-safety check together;
//! per-server state lives in a `DashMap` whose shard locking stands in for
//! the "per-server lock" (acquired only after the ledger-wide lock, never
//! the reverse, so the two can never deadlock against each other).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, ReleaseReason};
use crate::registry::ServerRegistry;
use crate::resource::{ResourceRequirement, ResourceVector};
use crate::types::{AgentId, Priority, QosClass, RequestId, ReservationState, ServerId};

/// A committed or in-flight allocation, owned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub agent_type: String,
    pub server_id: ServerId,
    pub requested: ResourceRequirement,
    pub granted: ResourceVector,
    pub priority: Priority,
    pub qos_class: QosClass,
    pub state: ReservationState,
    pub created_at_nanos: i64,
    pub last_transition_at_nanos: i64,
}

/// Everything needed to commit a new reservation, assembled by the scheduler
/// after a strategy has picked a server.
#[derive(Debug, Clone)]
pub struct ReservationDraft {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub agent_type: String,
    pub server_id: ServerId,
    pub requested: ResourceRequirement,
    pub granted: ResourceVector,
    pub priority: Priority,
    pub qos_class: QosClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshotExport {
    pub reservations: Vec<Reservation>,
}

pub struct AllocationLedger {
    reservations: DashMap<RequestId, Reservation>,
    committed_by_server: DashMap<ServerId, ResourceVector>,
    commit_lock: Mutex<()>,
    registry: Arc<ServerRegistry>,
    event_bus: Arc<EventBus>,
}

impl AllocationLedger {
    pub fn new(registry: Arc<ServerRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            reservations: DashMap::new(),
            committed_by_server: DashMap::new(),
            commit_lock: Mutex::new(()),
            registry,
            event_bus,
        }
    }

    pub fn committed_on(&self, server_id: &ServerId) -> ResourceVector {
        self.committed_by_server
            .get(server_id)
            .map(|r| r.clone())
            .unwrap_or_else(ResourceVector::zero)
    }

    /// Commit a reservation. Idempotent: an already-used `request_id` returns
    /// the existing reservation with no new mutation (spec §4.5 Idempotence).
    #[instrument(skip(self, draft), fields(request_id = %draft.request_id, server_id = %draft.server_id))]
    pub fn commit(&self, draft: ReservationDraft, now_nanos: i64) -> EngineResult<Reservation> {
        let _guard = self.commit_lock.lock();

        if let Some(existing) = self.reservations.get(&draft.request_id) {
            return Ok(existing.clone());
        }

        let server = self
            .registry
            .get(&draft.server_id)
            .ok_or_else(|| EngineError::UnknownServer(draft.server_id.to_string()))?;

        let already_committed = self.committed_on(&draft.server_id);
        let total_committed = already_committed.add(&draft.granted);
        let (_, underflow) = server.last_report.available_given(&total_committed);
        if underflow {
            warn!(server_id = %draft.server_id, "commit lost race: capacity exhausted");
            return Err(EngineError::CapacityExhausted {
                server_id: draft.server_id.to_string(),
            });
        }

        let reservation = Reservation {
            request_id: draft.request_id.clone(),
            agent_id: draft.agent_id,
            agent_type: draft.agent_type,
            server_id: draft.server_id.clone(),
            requested: draft.requested,
            granted: draft.granted.clone(),
            priority: draft.priority,
            qos_class: draft.qos_class,
            state: ReservationState::Active,
            created_at_nanos: now_nanos,
            last_transition_at_nanos: now_nanos,
        };

        self.committed_by_server
            .entry(draft.server_id.clone())
            .and_modify(|c| *c = c.add(&draft.granted))
            .or_insert_with(|| draft.granted.clone());

        self.registry.note_commit(&draft.server_id, &draft.granted)?;

        self.reservations
            .insert(draft.request_id.clone(), reservation.clone());

        info!(request_id = %draft.request_id, server_id = %draft.server_id, "reservation committed");
        self.event_bus.publish(EngineEvent::AllocationCommitted {
            request_id: draft.request_id.to_string(),
            server_id: draft.server_id,
            granted: draft.granted,
        });

        Ok(reservation)
    }

    /// Release a reservation. Idempotent; unknown ids are a silent no-op
    /// (spec §4.3, §7).
    #[instrument(skip(self))]
    pub fn release(&self, request_id: &RequestId, reason: ReleaseReason) -> EngineResult<bool> {
        let _guard = self.commit_lock.lock();

        let mut entry = match self.reservations.get_mut(request_id) {
            Some(e) => e,
            None => return Ok(false),
        };

        if entry.state == ReservationState::Released {
            return Ok(false);
        }

        entry.state = ReservationState::Released;

        let server_id = entry.server_id.clone();
        let granted = entry.granted.clone();
        drop(entry);

        self.committed_by_server
            .entry(server_id.clone())
            .and_modify(|c| *c = c.subtract_saturating(&granted).0);
        self.registry.note_release(&server_id, &granted)?;

        info!(%request_id, "reservation released");
        self.event_bus.publish(EngineEvent::Released {
            request_id: request_id.to_string(),
            reason,
        });

        Ok(true)
    }

    /// Transition a reservation's state without releasing it (e.g. into
    /// `Migrating`). Returns `UnknownRequest` for an unknown id.
    pub fn mark(&self, request_id: &RequestId, next: ReservationState, now_nanos: i64) -> EngineResult<()> {
        let mut entry = self
            .reservations
            .get_mut(request_id)
            .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;

        if !entry.state.can_transition_to(next) {
            return Err(EngineError::InvalidRequest(format!(
                "illegal reservation transition {:?} -> {:?}",
                entry.state, next
            )));
        }
        entry.state = next;
        entry.last_transition_at_nanos = now_nanos;
        Ok(())
    }

    pub fn get(&self, request_id: &RequestId) -> Option<Reservation> {
        self.reservations.get(request_id).map(|r| r.clone())
    }

    pub fn list_by_server(&self, server_id: &ServerId) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|r| &r.server_id == server_id)
            .map(|r| r.clone())
            .collect()
    }

    pub fn list_by_agent(&self, agent_id: &AgentId) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|r| &r.agent_id == agent_id)
            .map(|r| r.clone())
            .collect()
    }

    pub fn export_state(&self) -> LedgerSnapshotExport {
        LedgerSnapshotExport {
            reservations: self.reservations.iter().map(|r| r.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::registry::{ServerRegistry, ServerReport};
    use crate::types::ServerStatus;

    fn setup() -> (Arc<ServerRegistry>, AllocationLedger) {
        let bus = Arc::new(EventBus::new(64));
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), bus.clone()));
        registry
            .ingest_report(ServerReport {
                server_id: "s1".into(),
                timestamp_nanos: 1,
                resources: ResourceVector {
                    cpu_cores: 4.0,
                    cpu_usage_percent: 0.0,
                    memory_total_bytes: 4_000_000_000,
                    memory_used_bytes: 0,
                    ..ResourceVector::zero()
                },
                reported_status: ServerStatus::Healthy,
            })
            .unwrap();
        let ledger = AllocationLedger::new(registry.clone(), bus);
        (registry, ledger)
    }

    fn draft(request_id: &str, cpu: f64, mem: u64) -> ReservationDraft {
        ReservationDraft {
            request_id: request_id.into(),
            agent_id: "agent-1".into(),
            agent_type: "worker".into(),
            server_id: "s1".into(),
            requested: ResourceRequirement::default(),
            granted: ResourceVector {
                cpu_cores: cpu,
                memory_used_bytes: mem,
                ..ResourceVector::zero()
            },
            priority: Priority::Normal,
            qos_class: QosClass::Burstable,
        }
    }

    #[test]
    fn commit_then_release_restores_capacity() {
        let (_registry, ledger) = setup();
        ledger.commit(draft("r1", 2.0, 1_000_000_000), 10).unwrap();
        assert_eq!(ledger.committed_on(&"s1".into()).cpu_cores, 2.0);

        ledger.release(&"r1".into(), ReleaseReason::Client).unwrap();
        assert_eq!(ledger.committed_on(&"s1".into()).cpu_cores, 0.0);
    }

    #[test]
    fn commit_is_idempotent_for_repeated_request_id() {
        let (_registry, ledger) = setup();
        let first = ledger.commit(draft("r1", 2.0, 1_000_000_000), 10).unwrap();
        let second = ledger.commit(draft("r1", 3.0, 2_000_000_000), 20).unwrap();
        assert_eq!(first.granted.cpu_cores, second.granted.cpu_cores);
        assert_eq!(ledger.committed_on(&"s1".into()).cpu_cores, 2.0);
    }

    #[test]
    fn commit_beyond_capacity_is_capacity_exhausted() {
        let (_registry, ledger) = setup();
        let result = ledger.commit(draft("r1", 100.0, 1_000_000_000), 10);
        assert!(matches!(result, Err(EngineError::CapacityExhausted { .. })));
    }

    #[test]
    fn release_of_unknown_request_is_noop() {
        let (_registry, ledger) = setup();
        let released = ledger.release(&"missing".into(), ReleaseReason::Client).unwrap();
        assert!(!released);
    }

    #[test]
    fn release_is_idempotent() {
        let (_registry, ledger) = setup();
        ledger.commit(draft("r1", 1.0, 500_000_000), 10).unwrap();
        assert!(ledger.release(&"r1".into(), ReleaseReason::Client).unwrap());
        assert!(!ledger.release(&"r1".into(), ReleaseReason::Client).unwrap());
    }
}
