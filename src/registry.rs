//! Server registry & health tracker (spec §4.2)
//!
//! Grounded on `knhk_consensus::validator::ValidatorSet`/`ValidatorInfo`: a
//! `DashMap` keyed by id, per-entry health derived from a reported metric,
//! and a timeout-driven sweep that flips stale entries to an unhealthy state.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::resource::ResourceVector;
use crate::types::{ServerId, ServerStatus};

/// A report pushed by a server (spec §6). `reported_status` is advisory only;
/// the registry always recomputes `status` itself from thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerReport {
    pub server_id: ServerId,
    pub timestamp_nanos: i64,
    pub resources: ResourceVector,
    pub reported_status: ServerStatus,
}

/// Live state for one server, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub server_id: ServerId,
    pub last_report: ResourceVector,
    pub last_report_timestamp_nanos: i64,
    pub last_heartbeat_nanos: i64,
    pub status: ServerStatus,
    pub committed: ResourceVector,
    pub generation: u64,
}

impl ServerState {
    /// Resources still free to grant: `capacity - committed`, saturating.
    pub fn available(&self) -> ResourceVector {
        self.last_report.available_given(&self.committed).0
    }
}

/// An immutable point-in-time view of the fleet, cheap to clone and iterate
/// without holding the registry's internal lock across strategy calls.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub servers: Vec<ServerState>,
}

impl RegistrySnapshot {
    pub fn get(&self, server_id: &ServerId) -> Option<&ServerState> {
        self.servers.iter().find(|s| &s.server_id == server_id)
    }

    pub fn schedulable(&self) -> impl Iterator<Item = &ServerState> {
        self.servers.iter().filter(|s| s.status.is_schedulable())
    }
}

/// Aggregate fleet health, grounded on `AgentSwarm::health_check()`'s
/// healthy/total ratio (spec §10.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FleetHealth {
    pub healthy: usize,
    pub total: usize,
}

impl FleetHealth {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}

/// Serializable export of the registry, for a collaborator to persist
/// externally (spec §6 "Persisted state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshotExport {
    pub servers: Vec<ServerState>,
}

pub struct ServerRegistry {
    servers: DashMap<ServerId, ServerState>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl ServerRegistry {
    pub fn new(config: EngineConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            servers: DashMap::new(),
            config,
            event_bus,
        }
    }

    fn derive_status(&self, resources: &ResourceVector) -> ServerStatus {
        let cpu = resources.cpu_usage_percent;
        let mem = resources.utilization_of(crate::resource::Dimension::Memory);
        let gpu = resources.utilization_of(crate::resource::Dimension::Gpu);

        let crit = cpu >= self.config.cpu_crit_pct
            || mem >= self.config.mem_crit_pct
            || gpu >= self.config.gpu_crit_pct;
        let warn = cpu >= self.config.cpu_warn_pct
            || mem >= self.config.mem_warn_pct
            || gpu >= self.config.gpu_warn_pct;

        if crit {
            ServerStatus::Overloaded
        } else if warn {
            ServerStatus::Degraded
        } else {
            ServerStatus::Healthy
        }
    }

    /// Update or create the `ServerState` for a report. Older reports (by
    /// timestamp) for a known server are rejected silently; the registry
    /// keeps the freshest (spec §4.2 failure semantics).
    #[instrument(skip(self, report), fields(server_id = %report.server_id))]
    pub fn ingest_report(&self, report: ServerReport) -> EngineResult<()> {
        report.resources.validate()?;

        let mut emit: Option<(ServerStatus, ServerStatus, u64)> = None;

        match self.servers.entry(report.server_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let state = occ.get_mut();
                if report.timestamp_nanos <= state.last_report_timestamp_nanos {
                    debug!(
                        server_id = %report.server_id,
                        "rejecting out-of-order or duplicate report"
                    );
                    return Ok(());
                }
                let old_status = state.status;
                let new_status = self.derive_status(&report.resources);
                state.last_report = report.resources;
                state.last_report_timestamp_nanos = report.timestamp_nanos;
                state.last_heartbeat_nanos = report.timestamp_nanos;
                state.status = new_status;
                state.generation += 1;
                if old_status != new_status {
                    emit = Some((old_status, new_status, state.generation));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                let status = self.derive_status(&report.resources);
                let state = ServerState {
                    server_id: report.server_id.clone(),
                    last_report: report.resources,
                    last_report_timestamp_nanos: report.timestamp_nanos,
                    last_heartbeat_nanos: report.timestamp_nanos,
                    status,
                    committed: ResourceVector::zero(),
                    generation: 0,
                };
                vac.insert(state);
                emit = Some((status, status, 0));
                info!(server_id = %report.server_id, "server registered");
            }
        }

        if let Some((old_status, new_status, generation)) = emit {
            if old_status != new_status {
                warn!(
                    server_id = %report.server_id,
                    ?old_status,
                    ?new_status,
                    "server status transition"
                );
            }
            self.event_bus.publish(EngineEvent::ServerStateChanged {
                server_id: report.server_id,
                old_status,
                new_status,
                generation,
            });
        }

        Ok(())
    }

    /// Mark `server_id` removed. Outstanding reservations transition to
    /// `Migrating` via the rebalancer reacting to the `Offline` event this
    /// emits (§4.7); unknown ids are a no-op.
    #[instrument(skip(self))]
    pub fn deregister(&self, server_id: &ServerId) {
        if let Some((_, state)) = self.servers.remove(server_id) {
            info!(%server_id, "server deregistered");
            self.event_bus.publish(EngineEvent::ServerStateChanged {
                server_id: server_id.clone(),
                old_status: state.status,
                new_status: ServerStatus::Offline,
                generation: state.generation + 1,
            });
        }
    }

    /// Flip any server whose last heartbeat is older than `offline_timeout_ms`
    /// to `Offline`. Runs periodically from the engine's background task.
    #[instrument(skip(self))]
    pub fn heartbeat_sweep(&self, now_nanos: i64) {
        let timeout_nanos = self.config.offline_timeout_ms as i64 * 1_000_000;
        let mut transitions = Vec::new();

        for mut entry in self.servers.iter_mut() {
            let state = entry.value_mut();
            if state.status == ServerStatus::Offline {
                continue;
            }
            if now_nanos - state.last_heartbeat_nanos > timeout_nanos {
                let old_status = state.status;
                state.status = ServerStatus::Offline;
                state.generation += 1;
                transitions.push((state.server_id.clone(), old_status, state.generation));
            }
        }

        for (server_id, old_status, generation) in transitions {
            warn!(%server_id, "server heartbeat timed out, marking offline");
            self.event_bus.publish(EngineEvent::ServerStateChanged {
                server_id,
                old_status,
                new_status: ServerStatus::Offline,
                generation,
            });
        }
    }

    /// Record that `granted` resources were committed against `server_id`'s
    /// rollup (called by the ledger/scheduler, not derived from reports).
    pub fn note_commit(&self, server_id: &ServerId, granted: &ResourceVector) -> EngineResult<()> {
        let mut state = self
            .servers
            .get_mut(server_id)
            .ok_or_else(|| EngineError::UnknownServer(server_id.to_string()))?;
        state.committed = state.committed.add(granted);
        state.generation += 1;
        Ok(())
    }

    /// Reverse of `note_commit`, called on release.
    pub fn note_release(&self, server_id: &ServerId, granted: &ResourceVector) -> EngineResult<()> {
        let mut state = self
            .servers
            .get_mut(server_id)
            .ok_or_else(|| EngineError::UnknownServer(server_id.to_string()))?;
        state.committed = state.committed.subtract_saturating(granted).0;
        state.generation += 1;
        Ok(())
    }

    pub fn get(&self, server_id: &ServerId) -> Option<ServerState> {
        self.servers.get(server_id).map(|r| r.clone())
    }

    /// Clone-and-iterate snapshot (RCU-style: the lock, if any, is held only
    /// long enough to clone each entry).
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            servers: self.servers.iter().map(|r| r.value().clone()).collect(),
        }
    }

    pub fn fleet_health(&self) -> FleetHealth {
        let total = self.servers.len();
        let healthy = self
            .servers
            .iter()
            .filter(|r| matches!(r.value().status, ServerStatus::Healthy))
            .count();
        FleetHealth { healthy, total }
    }

    pub fn export_state(&self) -> RegistrySnapshotExport {
        RegistrySnapshotExport {
            servers: self.servers.iter().map(|r| r.value().clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(EngineConfig::default(), Arc::new(EventBus::new(64)))
    }

    fn report(server_id: &str, ts: i64, cpu_pct: f64) -> ServerReport {
        ServerReport {
            server_id: server_id.into(),
            timestamp_nanos: ts,
            resources: ResourceVector {
                cpu_cores: 8.0,
                cpu_usage_percent: cpu_pct,
                memory_total_bytes: 16_000_000_000,
                memory_used_bytes: 4_000_000_000,
                ..ResourceVector::zero()
            },
            reported_status: ServerStatus::Healthy,
        }
    }

    #[test]
    fn first_report_creates_healthy_server() {
        let reg = registry();
        reg.ingest_report(report("s1", 1, 20.0)).unwrap();
        let state = reg.get(&"s1".into()).unwrap();
        assert_eq!(state.status, ServerStatus::Healthy);
        assert_eq!(state.generation, 0);
    }

    #[test]
    fn out_of_order_report_is_rejected_silently() {
        let reg = registry();
        reg.ingest_report(report("s1", 10, 20.0)).unwrap();
        reg.ingest_report(report("s1", 5, 99.0)).unwrap();
        let state = reg.get(&"s1".into()).unwrap();
        assert_eq!(state.last_report_timestamp_nanos, 10);
        assert_eq!(state.status, ServerStatus::Healthy);
    }

    #[test]
    fn high_cpu_usage_drives_overloaded_status() {
        let reg = registry();
        reg.ingest_report(report("s1", 1, 20.0)).unwrap();
        reg.ingest_report(report("s1", 2, 95.0)).unwrap();
        let state = reg.get(&"s1".into()).unwrap();
        assert_eq!(state.status, ServerStatus::Overloaded);
    }

    #[test]
    fn heartbeat_sweep_marks_stale_server_offline() {
        let reg = registry();
        reg.ingest_report(report("s1", 1, 20.0)).unwrap();
        let timeout_ns = reg.config.offline_timeout_ms as i64 * 1_000_000;
        reg.heartbeat_sweep(1 + timeout_ns + 1);
        let state = reg.get(&"s1".into()).unwrap();
        assert_eq!(state.status, ServerStatus::Offline);
    }

    #[test]
    fn deregister_unknown_server_is_noop() {
        let reg = registry();
        reg.deregister(&"missing".into());
    }

    #[test]
    fn available_shrinks_as_commitments_grow() {
        let reg = registry();
        reg.ingest_report(report("s1", 1, 20.0)).unwrap();
        let before = reg.get(&"s1".into()).unwrap().available();
        assert_eq!(before.available_memory_bytes(), 12_000_000_000);

        reg.note_commit(
            &"s1".into(),
            &ResourceVector {
                memory_used_bytes: 5_000_000_000,
                ..ResourceVector::zero()
            },
        )
        .unwrap();
        let after = reg.get(&"s1".into()).unwrap().available();
        assert_eq!(after.available_memory_bytes(), 7_000_000_000);
    }
}
