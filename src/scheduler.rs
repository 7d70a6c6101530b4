//! The scheduler: admission, candidate filtering, strategy dispatch, commit
//! retries, and the pending-request queue (spec §4.5).

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{AllocationFailureReason, EngineEvent, EventBus};
use crate::ledger::{AllocationLedger, Reservation, ReservationDraft};
use crate::registry::{RegistrySnapshot, ServerRegistry};
use crate::resource::{LoadWeights, ResourceAmount, ResourceRequirement, ResourceVector};
use crate::strategy;
use crate::types::{AgentId, Priority, QosClass, RequestId, ServerId};

/// An inbound allocation request (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub agent_type: String,
    /// Identity whose fleet-wide share `FairShare` balances against; the
    /// donor's "requester" concept, distinct from `agent_id` when one logical
    /// requester owns many agents. Defaults to `agent_id` when unset by a
    /// caller that has no separate concept of requester.
    pub requester: String,
    pub requested: ResourceRequirement,
    pub priority: Priority,
    pub qos_class: QosClass,
    pub preferred_servers: BTreeSet<ServerId>,
    pub excluded_servers: BTreeSet<ServerId>,
    pub max_queue_wait_nanos: i64,
    pub deadline_nanos: Option<i64>,
}

/// Outcome of a successful `allocate` call (errors go through `EngineResult`).
#[derive(Debug, Clone)]
pub enum AllocationOutcome {
    Committed(Reservation),
    Queued {
        position: usize,
        estimated_wait_nanos: i64,
    },
    NoCapacity {
        shortage: ResourceVector,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey(Priority, Reverse<i64>);

/// FIFO-within-priority queue ordered by `(-priority, arrivalTimestamp)`
/// (spec §4.5 step 5).
struct PendingQueue {
    order: Mutex<PriorityQueue<RequestId, QueueKey>>,
    requests: DashMap<RequestId, (AllocationRequest, i64)>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            order: Mutex::new(PriorityQueue::new()),
            requests: DashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.requests.len()
    }

    /// Enqueue and return this request's 1-based position (1 = next to drain).
    fn enqueue(&self, request: AllocationRequest, arrival_nanos: i64) -> usize {
        let key = QueueKey(request.priority, Reverse(arrival_nanos));
        let request_id = request.request_id.clone();
        self.order.lock().push(request_id.clone(), key);
        self.requests.insert(request_id, (request, arrival_nanos));
        self.position_of(&key)
    }

    fn position_of(&self, key: &QueueKey) -> usize {
        self.order
            .lock()
            .iter()
            .filter(|(_, k)| *k >= key)
            .count()
    }

    /// Remove a specific request (for cancellation). No-op if absent.
    fn remove(&self, request_id: &RequestId) -> bool {
        let removed_from_order = self.order.lock().remove(request_id).is_some();
        self.requests.remove(request_id);
        removed_from_order
    }

    /// Pop the single highest-priority, earliest-arrived request.
    fn pop(&self) -> Option<AllocationRequest> {
        let request_id = self.order.lock().pop().map(|(id, _)| id)?;
        self.requests.remove(&request_id).map(|(_, (req, _))| req)
    }
}

fn missing_amount(requested: &ResourceAmount, available: &ResourceVector) -> ResourceAmount {
    ResourceAmount {
        cpu_cores: (requested.cpu_cores - available.cpu_cores).max(0.0),
        memory_bytes: requested
            .memory_bytes
            .saturating_sub(available.available_memory_bytes()),
        disk_bytes: requested
            .disk_bytes
            .saturating_sub(available.available_disk_bytes()),
        network_bandwidth_bps: requested
            .network_bandwidth_bps
            .saturating_sub(available.network_bandwidth_bps),
        gpu_count: requested.gpu_count.saturating_sub(available.gpu_count() as u32),
        gpu_memory_bytes: requested
            .gpu_memory_bytes
            .saturating_sub(available.available_gpu_memory_bytes()),
        capabilities: requested.capabilities.difference(&available.capabilities).cloned().collect(),
    }
}

fn magnitude(amount: &ResourceAmount) -> f64 {
    amount.cpu_cores
        + amount.memory_bytes as f64 / 1e9
        + amount.disk_bytes as f64 / 1e9
        + amount.network_bandwidth_bps as f64 / 1e9
        + amount.gpu_count as f64
}

pub struct Scheduler {
    registry: Arc<ServerRegistry>,
    ledger: Arc<AllocationLedger>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    queue: PendingQueue,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        ledger: Arc<AllocationLedger>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            event_bus,
            config,
            queue: PendingQueue::new(),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    fn validate_admission(&self, request: &AllocationRequest) -> EngineResult<()> {
        if request.agent_id.as_ref().is_empty() {
            return Err(EngineError::InvalidRequest("agent_id must not be empty".into()));
        }
        if request.requested.minimum.cpu_cores < 0.0 {
            return Err(EngineError::InvalidRequest(
                "requested.minimum.cpu_cores must be >= 0".into(),
            ));
        }
        if request.requested.minimum.memory_bytes == 0 {
            return Err(EngineError::InvalidRequest(
                "requested.minimum.memory_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn candidates(&self, request: &AllocationRequest, exclude: Option<&ServerId>) -> (RegistrySnapshot, Vec<crate::registry::ServerState>) {
        let snapshot = self.registry.snapshot();
        let mut candidates: Vec<_> = snapshot
            .schedulable()
            .filter(|s| !request.excluded_servers.contains(&s.server_id))
            .filter(|s| exclude.map_or(true, |ex| &s.server_id != ex))
            .cloned()
            .collect();

        if !request.preferred_servers.is_empty() {
            let preferred: Vec<_> = candidates
                .iter()
                .filter(|s| request.preferred_servers.contains(&s.server_id))
                .cloned()
                .collect();
            if !preferred.is_empty() {
                candidates = preferred;
            }
        }

        candidates.retain(|s| s.available().meets(&request.requested.minimum));
        (snapshot, candidates)
    }

    fn shortage_for(&self, request: &AllocationRequest, snapshot: &RegistrySnapshot) -> ResourceVector {
        let best = snapshot
            .schedulable()
            .map(|s| missing_amount(&request.requested.minimum, &s.available()))
            .min_by(|a, b| magnitude(a).partial_cmp(&magnitude(b)).unwrap());

        match best {
            Some(amount) => ResourceVector::from_amount(&amount),
            None => ResourceVector::from_amount(&request.requested.minimum),
        }
    }

    /// Run the admission → candidate filter → strategy → commit pipeline.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub fn allocate(&self, request: AllocationRequest, now_nanos: i64) -> EngineResult<AllocationOutcome> {
        if let Some(existing) = self.ledger.get(&request.request_id) {
            return Ok(AllocationOutcome::Committed(existing));
        }

        if let Err(err) = self.validate_admission(&request) {
            self.event_bus.publish(EngineEvent::AllocationFailed {
                request_id: request.request_id.to_string(),
                reason: AllocationFailureReason::from(&err),
            });
            return Err(err);
        }

        let mut last_snapshot = None;
        for _attempt in 0..self.config.max_commit_retries {
            let (snapshot, candidates) = self.candidates(&request, None);
            let chosen = strategy::select(self.config.default_strategy, &candidates, &request, &self.ledger);
            last_snapshot = Some(snapshot);

            let Some(server_id) = chosen else {
                break;
            };

            let draft = ReservationDraft {
                request_id: request.request_id.clone(),
                agent_id: request.agent_id.clone(),
                agent_type: request.agent_type.clone(),
                server_id,
                requested: request.requested.clone(),
                granted: ResourceVector::from_amount(&request.requested.minimum),
                priority: request.priority,
                qos_class: request.qos_class,
            };

            match self.ledger.commit(draft, now_nanos) {
                Ok(reservation) => return Ok(AllocationOutcome::Committed(reservation)),
                Err(EngineError::CapacityExhausted { server_id }) => {
                    warn!(%server_id, "commit race lost, retrying with fresh snapshot");
                    continue;
                }
                Err(err) => {
                    self.event_bus.publish(EngineEvent::AllocationFailed {
                        request_id: request.request_id.to_string(),
                        reason: AllocationFailureReason::from(&err),
                    });
                    return Err(err);
                }
            }
        }

        if request.max_queue_wait_nanos > 0 {
            let position = self.queue.enqueue(request.clone(), now_nanos);
            let estimated_wait_nanos =
                position as i64 * self.config.heartbeat_interval_ms as i64 * 1_000_000;
            info!(request_id = %request.request_id, position, "request queued");
            self.event_bus.publish(EngineEvent::AllocationQueued {
                request_id: request.request_id.to_string(),
                position,
            });
            return Ok(AllocationOutcome::Queued {
                position,
                estimated_wait_nanos,
            });
        }

        let snapshot = last_snapshot.unwrap_or_else(|| self.registry.snapshot());
        let shortage = self.shortage_for(&request, &snapshot);
        self.event_bus.publish(EngineEvent::AllocationFailed {
            request_id: request.request_id.to_string(),
            reason: AllocationFailureReason::NoCapacity {
                shortage: shortage.clone(),
            },
        });
        Ok(AllocationOutcome::NoCapacity { shortage })
    }

    /// Idempotent release. Also removes the request from the pending queue if
    /// it was never committed (cancellation race, spec §5).
    pub fn release(&self, request_id: &RequestId) -> EngineResult<bool> {
        if self.queue.remove(request_id) {
            return Ok(true);
        }
        self.ledger.release(request_id, crate::events::ReleaseReason::Client)
    }

    /// Cancel a still-queued request; atomically removes it so that a racing
    /// drain can never commit it afterward (spec §5 cancellation semantics).
    pub fn cancel_queued(&self, request_id: &RequestId) -> bool {
        self.queue.remove(request_id)
    }

    /// Plan a new placement for an already-active reservation, excluding its
    /// current server (used by the rebalancer, spec §4.7).
    pub fn plan_migration(&self, reservation: &Reservation) -> Option<ServerId> {
        let synthetic = AllocationRequest {
            request_id: reservation.request_id.clone(),
            agent_id: reservation.agent_id.clone(),
            agent_type: reservation.agent_type.clone(),
            requester: reservation.agent_id.to_string(),
            requested: reservation.requested.clone(),
            priority: reservation.priority,
            qos_class: reservation.qos_class,
            preferred_servers: BTreeSet::new(),
            excluded_servers: BTreeSet::new(),
            max_queue_wait_nanos: 0,
            deadline_nanos: None,
        };
        let (_, candidates) = self.candidates(&synthetic, Some(&reservation.server_id));
        strategy::select(
            self.config.default_strategy,
            &candidates,
            &synthetic,
            &self.ledger,
        )
    }

    /// Drain the pending queue: one full pass, attempting to place each
    /// queued request against the current registry state. Requests that
    /// still don't fit are re-enqueued at their original priority/arrival key
    /// (spec §4.5: "drained whenever... increased free capacity").
    #[instrument(skip(self))]
    pub fn drain_queue(&self, now_nanos: i64) {
        let pending = self.queue.len();
        for _ in 0..pending {
            let Some(request) = self.queue.pop() else {
                break;
            };
            match self.allocate(request.clone(), now_nanos) {
                Ok(AllocationOutcome::Committed(_)) => {
                    info!(request_id = %request.request_id, "queued request committed on drain");
                }
                Ok(AllocationOutcome::Queued { .. }) => {
                    // allocate() re-enqueued it already (still no capacity).
                }
                _ => {}
            }
        }
    }

    pub fn weighted_load_hint(&self, server: &crate::registry::ServerState) -> f64 {
        server.last_report.weighted_load(LoadWeights::default())
    }
}
