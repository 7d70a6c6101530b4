//! Agent lifecycle controller: QoS semantics, auto-scaling, health checks
//! (spec §4.8).

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::ledger::AllocationLedger;
use crate::resource::ResourceRequirement;
use crate::scheduler::{AllocationOutcome, AllocationRequest, Scheduler};
use crate::types::{AgentId, Priority, QosClass, ReservationState};

/// Scaling window configuration for one agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingWindow {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub scale_up_threshold_pct: f64,
    pub scale_down_threshold_pct: f64,
    pub scale_up_cooldown_nanos: i64,
    pub scale_down_cooldown_nanos: i64,
}

/// Health-check configuration for one agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval_nanos: i64,
    pub timeout_nanos: i64,
    pub retries: u32,
}

/// Per-agent profile owned by the controller (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub qos_class: QosClass,
    pub priority: Priority,
    pub requested: ResourceRequirement,
    pub scaling: ScalingWindow,
    pub health_check: HealthCheckConfig,
    pub last_scale_up_nanos: i64,
    pub last_scale_down_nanos: i64,
    pub replica_count: u32,
    pub consecutive_health_failures: u32,
}

impl AgentProfile {
    /// What `granted` should equal for this profile's QoS class (spec §4.8).
    pub fn qos_target(&self) -> &crate::resource::ResourceAmount {
        match self.qos_class {
            QosClass::Guaranteed => &self.requested.preferred,
            QosClass::Burstable | QosClass::BestEffort => &self.requested.minimum,
        }
    }
}

pub struct AgentController {
    profiles: Mutex<std::collections::HashMap<AgentId, AgentProfile>>,
    ledger: Arc<AllocationLedger>,
    scheduler: Arc<Scheduler>,
    event_bus: Arc<EventBus>,
}

impl AgentController {
    pub fn new(ledger: Arc<AllocationLedger>, scheduler: Arc<Scheduler>, event_bus: Arc<EventBus>) -> Self {
        Self {
            profiles: Mutex::new(std::collections::HashMap::new()),
            ledger,
            scheduler,
            event_bus,
        }
    }

    pub fn register(&self, profile: AgentProfile) {
        info!(agent_id = %profile.agent_id, "agent profile registered");
        self.profiles.lock().insert(profile.agent_id.clone(), profile);
    }

    pub fn deregister(&self, agent_id: &AgentId) {
        self.profiles.lock().remove(agent_id);
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentProfile> {
        self.profiles.lock().get(agent_id).cloned()
    }

    /// Attempt to add one replica by issuing a new `allocate` for this agent.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn scale_up(&self, agent_id: &AgentId, now_nanos: i64) -> EngineResult<bool> {
        let mut profiles = self.profiles.lock();
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown agent profile {agent_id}")))?;

        if profile.replica_count >= profile.scaling.max_replicas {
            return Ok(false);
        }
        if now_nanos - profile.last_scale_up_nanos < profile.scaling.scale_up_cooldown_nanos {
            return Ok(false);
        }

        let request = AllocationRequest {
            request_id: format!("{}-replica-{}", agent_id, profile.replica_count + 1).into(),
            agent_id: agent_id.clone(),
            agent_type: profile.agent_type.clone(),
            requester: agent_id.to_string(),
            requested: profile.requested.clone(),
            priority: profile.priority,
            qos_class: profile.qos_class,
            preferred_servers: Default::default(),
            excluded_servers: Default::default(),
            max_queue_wait_nanos: 0,
            deadline_nanos: None,
        };

        drop(profiles);
        let outcome = self.scheduler.allocate(request, now_nanos)?;
        let mut profiles = self.profiles.lock();
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown agent profile {agent_id}")))?;

        match outcome {
            AllocationOutcome::Committed(_) => {
                profile.replica_count += 1;
                profile.last_scale_up_nanos = now_nanos;
                info!(agent_id = %agent_id, replicas = profile.replica_count, "scaled up");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release the newest reservation belonging to this agent.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn scale_down(&self, agent_id: &AgentId, now_nanos: i64) -> EngineResult<bool> {
        let mut profiles = self.profiles.lock();
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown agent profile {agent_id}")))?;

        if profile.replica_count <= profile.scaling.min_replicas {
            return Ok(false);
        }
        if now_nanos - profile.last_scale_down_nanos < profile.scaling.scale_down_cooldown_nanos {
            return Ok(false);
        }

        let newest = self
            .ledger
            .list_by_agent(agent_id)
            .into_iter()
            .filter(|r| r.state == ReservationState::Active)
            .max_by_key(|r| r.created_at_nanos);

        let Some(reservation) = newest else {
            return Ok(false);
        };

        self.ledger.release(&reservation.request_id, crate::events::ReleaseReason::Client)?;
        profile.replica_count -= 1;
        profile.last_scale_down_nanos = now_nanos;
        info!(agent_id = %agent_id, replicas = profile.replica_count, "scaled down");
        Ok(true)
    }

    /// Feed a usage sample and apply the auto-scaling rules (spec §4.8).
    pub fn report_usage(&self, agent_id: &AgentId, usage_pct: f64, now_nanos: i64) -> EngineResult<()> {
        let (up_threshold, down_threshold) = {
            let profiles = self.profiles.lock();
            let profile = profiles
                .get(agent_id)
                .ok_or_else(|| EngineError::InvalidRequest(format!("unknown agent profile {agent_id}")))?;
            (profile.scaling.scale_up_threshold_pct, profile.scaling.scale_down_threshold_pct)
        };

        if usage_pct > up_threshold {
            self.scale_up(agent_id, now_nanos)?;
        } else if usage_pct < down_threshold {
            self.scale_down(agent_id, now_nanos)?;
        }
        Ok(())
    }

    /// Record a health-check result; emits `AgentUnhealthy` after
    /// `retries` consecutive failures.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn health_check_tick(&self, agent_id: &AgentId, healthy: bool) -> EngineResult<()> {
        let mut profiles = self.profiles.lock();
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown agent profile {agent_id}")))?;

        if healthy {
            profile.consecutive_health_failures = 0;
            return Ok(());
        }

        profile.consecutive_health_failures += 1;
        if profile.consecutive_health_failures >= profile.health_check.retries {
            warn!(agent_id = %agent_id, failures = profile.consecutive_health_failures, "agent unhealthy");
            self.event_bus.publish(EngineEvent::AgentUnhealthy {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(())
    }
}
