//! Placement strategies (spec §4.4)
//!
//! Each strategy is a pure function over `(candidates, request, ledger)` with
//! no wall-clock or randomness, so rebalancing decisions stay reproducible
//! (spec: "Strategies must be deterministic given the same inputs"). Ties are
//! always broken lexicographically on `serverId`.

use crate::ledger::AllocationLedger;
use crate::registry::ServerState;
use crate::resource::{LoadWeights, ResourceAmount};
use crate::scheduler::AllocationRequest;
use crate::types::{ServerId, StrategyKind};

fn lexicographically_smallest<'a>(candidates: &[&'a ServerState]) -> Option<&'a ServerState> {
    candidates.iter().copied().min_by(|a, b| a.server_id.cmp(&b.server_id))
}

/// Pick the extreme-scoring candidate, breaking ties on the smallest `serverId`.
fn pick_extreme<'a>(
    candidates: &[&'a ServerState],
    minimize: bool,
    score: impl Fn(&ServerState) -> f64,
) -> Option<&'a ServerState> {
    let mut best: Option<(&ServerState, f64)> = None;
    for &candidate in candidates {
        let s = score(candidate);
        best = match best {
            None => Some((candidate, s)),
            Some((cur, cur_s)) => {
                let better = if minimize { s < cur_s } else { s > cur_s };
                if better {
                    Some((candidate, s))
                } else if (s - cur_s).abs() < f64::EPSILON && candidate.server_id < cur.server_id {
                    Some((candidate, s))
                } else {
                    Some((cur, cur_s))
                }
            }
        };
    }
    best.map(|(c, _)| c)
}

fn project_usage(server: &ServerState, amount: &ResourceAmount) -> crate::resource::ResourceVector {
    let mut v = server.last_report.clone();
    if v.cpu_cores > 0.0 {
        let added_pct = 100.0 * amount.cpu_cores / v.cpu_cores;
        v.cpu_usage_percent = (v.cpu_usage_percent + added_pct).min(100.0);
    }
    v.memory_used_bytes = v.memory_used_bytes.saturating_add(amount.memory_bytes);
    v.disk_used_bytes = v.disk_used_bytes.saturating_add(amount.disk_bytes);
    v
}

fn balanced<'a>(candidates: &[&'a ServerState], request: &AllocationRequest) -> Option<&'a ServerState> {
    pick_extreme(candidates, true, |s| {
        project_usage(s, &request.requested.minimum).weighted_load(LoadWeights::default())
    })
}

fn performance<'a>(candidates: &[&'a ServerState], _request: &AllocationRequest) -> Option<&'a ServerState> {
    pick_extreme(candidates, false, |s| {
        let cpu_use_fraction = s.last_report.cpu_usage_percent / 100.0;
        let avail_mem_gb = s.available().available_memory_bytes() as f64 / 1e9;
        let gpu_count = s.last_report.gpu_count() as f64;
        let bandwidth_gbps = s.last_report.network_bandwidth_bps as f64 / 1e9;
        let caps = s.last_report.capabilities.len() as f64;

        s.last_report.cpu_cores * (1.0 - cpu_use_fraction)
            + avail_mem_gb * 10.0
            + gpu_count * 50.0
            + bandwidth_gbps * 5.0
            + caps * 2.0
    })
}

fn efficiency<'a>(candidates: &[&'a ServerState], request: &AllocationRequest) -> Option<&'a ServerState> {
    let req = &request.requested.minimum;
    let feasible: Vec<&ServerState> = candidates
        .iter()
        .copied()
        .filter(|s| {
            let avail = s.available();
            avail.cpu_cores >= req.cpu_cores
                && avail.available_memory_bytes() >= req.memory_bytes
                && avail.available_disk_bytes() >= req.disk_bytes
        })
        .collect();

    pick_extreme(&feasible, true, |s| {
        let avail = s.available();
        let cpu_slack = avail.cpu_cores - req.cpu_cores;
        let mem_slack_gb = (avail.available_memory_bytes() as f64 - req.memory_bytes as f64) / 1e9;
        let disk_slack_gb = (avail.available_disk_bytes() as f64 - req.disk_bytes as f64) / 1e9;
        let net_slack_gbps =
            (avail.network_bandwidth_bps as f64 - req.network_bandwidth_bps as f64) / 1e9;
        cpu_slack + mem_slack_gb + disk_slack_gb * 0.1 + net_slack_gbps
    })
}

fn locality<'a>(
    candidates: &[&'a ServerState],
    request: &AllocationRequest,
    ledger: &AllocationLedger,
) -> Option<&'a ServerState> {
    let counts: Vec<(&ServerState, usize)> = candidates
        .iter()
        .map(|&s| {
            let count = ledger
                .list_by_server(&s.server_id)
                .into_iter()
                .filter(|r| {
                    r.agent_type == request.agent_type
                        && r.state == crate::types::ReservationState::Active
                })
                .count();
            (s, count)
        })
        .collect();

    let max_count = counts.iter().map(|(_, c)| *c).max()?;
    let tied: Vec<&ServerState> = counts
        .into_iter()
        .filter(|(_, c)| *c == max_count)
        .map(|(s, _)| s)
        .collect();

    if tied.len() == 1 {
        return Some(tied[0]);
    }
    balanced(&tied, request).or_else(|| lexicographically_smallest(&tied))
}

/// The `Priority` strategy governs *request* ordering (handled by the
/// scheduler's `PendingQueue`, spec §4.5 step 5); given a single request and
/// a candidate set it has no additional information to act on, so it
/// delegates to `Balanced` for the actual server pick.
fn priority<'a>(candidates: &[&'a ServerState], request: &AllocationRequest) -> Option<&'a ServerState> {
    balanced(candidates, request)
}

fn fair_share<'a>(
    candidates: &[&'a ServerState],
    request: &AllocationRequest,
    ledger: &AllocationLedger,
) -> Option<&'a ServerState> {
    pick_extreme(candidates, true, |s| {
        if s.last_report.cpu_cores <= 0.0 {
            return 0.0;
        }
        let requester_cpu: f64 = ledger
            .list_by_server(&s.server_id)
            .into_iter()
            .filter(|r| r.agent_id == request.agent_id && r.state == crate::types::ReservationState::Active)
            .map(|r| r.granted.cpu_cores)
            .sum();
        requester_cpu / s.last_report.cpu_cores
    })
}

fn best_fit<'a>(candidates: &[&'a ServerState], request: &AllocationRequest) -> Option<&'a ServerState> {
    let req = &request.requested.minimum;
    pick_extreme(candidates, true, |s| {
        let avail = s.available();
        let cpu_free = (avail.cpu_cores - req.cpu_cores).max(0.0);
        let mem_free_gb =
            ((avail.available_memory_bytes() as f64 - req.memory_bytes as f64) / 1e9).max(0.0);
        let disk_free_gb =
            ((avail.available_disk_bytes() as f64 - req.disk_bytes as f64) / 1e9).max(0.0);
        let net_free_gbps = ((avail.network_bandwidth_bps as f64 - req.network_bandwidth_bps as f64)
            / 1e9)
            .max(0.0);
        (cpu_free.powi(2) + mem_free_gb.powi(2) + disk_free_gb.powi(2) + net_free_gbps.powi(2)).sqrt()
    })
}

/// Dispatch to the configured strategy.
pub fn select(
    kind: StrategyKind,
    candidates: &[ServerState],
    request: &AllocationRequest,
    ledger: &AllocationLedger,
) -> Option<ServerId> {
    let refs: Vec<&ServerState> = candidates.iter().collect();
    let chosen = match kind {
        StrategyKind::Balanced => balanced(&refs, request),
        StrategyKind::Performance => performance(&refs, request),
        StrategyKind::Efficiency => efficiency(&refs, request),
        StrategyKind::Locality => locality(&refs, request, ledger),
        StrategyKind::Priority => priority(&refs, request),
        StrategyKind::FairShare => fair_share(&refs, request, ledger),
        StrategyKind::BestFit => best_fit(&refs, request),
    };
    chosen.map(|s| s.server_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::registry::{ServerRegistry, ServerReport};
    use crate::resource::{ResourceRequirement, ResourceVector};
    use crate::types::{Priority as ReqPriority, QosClass, ServerStatus};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn server_state(id: &str, cpu_cores: f64, cpu_pct: f64) -> ServerState {
        ServerState {
            server_id: id.into(),
            last_report: ResourceVector {
                cpu_cores,
                cpu_usage_percent: cpu_pct,
                memory_total_bytes: 16_000_000_000,
                memory_used_bytes: 4_000_000_000,
                ..ResourceVector::zero()
            },
            last_report_timestamp_nanos: 0,
            last_heartbeat_nanos: 0,
            status: ServerStatus::Healthy,
            committed: ResourceVector::zero(),
            generation: 0,
        }
    }

    fn request() -> AllocationRequest {
        AllocationRequest {
            request_id: "r1".into(),
            agent_id: "agent-1".into(),
            agent_type: "worker".into(),
            requester: "agent-1".into(),
            requested: ResourceRequirement {
                minimum: crate::resource::ResourceAmount {
                    cpu_cores: 2.0,
                    memory_bytes: 1_000_000_000,
                    capabilities: BTreeSet::new(),
                    ..Default::default()
                },
                preferred: crate::resource::ResourceAmount {
                    cpu_cores: 2.0,
                    memory_bytes: 1_000_000_000,
                    ..Default::default()
                },
            },
            priority: ReqPriority::Normal,
            qos_class: QosClass::Burstable,
            preferred_servers: BTreeSet::new(),
            excluded_servers: BTreeSet::new(),
            max_queue_wait_nanos: 0,
            deadline_nanos: None,
        }
    }

    fn ledger_for(registry: Arc<ServerRegistry>) -> AllocationLedger {
        AllocationLedger::new(registry, Arc::new(EventBus::new(16)))
    }

    #[test]
    fn balanced_prefers_less_loaded_server() {
        let s1 = server_state("s1", 8.0, 80.0);
        let s2 = server_state("s2", 8.0, 10.0);
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), Arc::new(EventBus::new(16))));
        let ledger = ledger_for(registry);
        let chosen = select(StrategyKind::Balanced, &[s1, s2], &request(), &ledger);
        assert_eq!(chosen, Some(ServerId::from("s2")));
    }

    #[test]
    fn deterministic_tie_break_picks_lexicographically_smallest() {
        let s1 = server_state("s1", 8.0, 50.0);
        let s2 = server_state("s2", 8.0, 50.0);
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), Arc::new(EventBus::new(16))));
        let ledger = ledger_for(registry);
        let chosen = select(StrategyKind::Balanced, &[s2.clone(), s1.clone()], &request(), &ledger);
        assert_eq!(chosen, Some(ServerId::from("s1")));
    }

    #[test]
    fn efficiency_rejects_infeasible_candidate() {
        let tiny = server_state("s1", 1.0, 0.0);
        let roomy = server_state("s2", 16.0, 0.0);
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), Arc::new(EventBus::new(16))));
        let ledger = ledger_for(registry);
        let chosen = select(StrategyKind::Efficiency, &[tiny, roomy], &request(), &ledger);
        assert_eq!(chosen, Some(ServerId::from("s2")));
    }

    #[test]
    fn locality_prefers_server_with_same_agent_type() {
        let s1 = server_state("s1", 8.0, 10.0);
        let s2 = server_state("s2", 8.0, 10.0);
        let registry = Arc::new(ServerRegistry::new(EngineConfig::default(), Arc::new(EventBus::new(16))));
        let ledger = ledger_for(registry.clone());

        let draft = crate::ledger::ReservationDraft {
            request_id: "existing".into(),
            agent_id: "agent-0".into(),
            agent_type: "worker".into(),
            server_id: "s2".into(),
            requested: ResourceRequirement::default(),
            granted: ResourceVector {
                cpu_cores: 1.0,
                ..ResourceVector::zero()
            },
            priority: ReqPriority::Normal,
            qos_class: QosClass::Burstable,
        };
        registry
            .ingest_report(ServerReport {
                server_id: "s2".into(),
                timestamp_nanos: 1,
                resources: ResourceVector {
                    cpu_cores: 8.0,
                    ..ResourceVector::zero()
                },
                reported_status: ServerStatus::Healthy,
            })
            .unwrap();
        ledger.commit(draft, 1).unwrap();

        let chosen = select(StrategyKind::Locality, &[s1, s2], &request(), &ledger);
        assert_eq!(chosen, Some(ServerId::from("s2")));
    }
}
