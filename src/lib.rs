//! Resource-aware workload orchestrator
//!
//! Binds resource requirements to servers across a fleet: a server registry
//! and health tracker, an allocation ledger, pluggable placement strategies,
//! a pressure detector and rebalancer, and an agent lifecycle controller.
//!
//! # Architecture
//!
//! - **ServerRegistry**: authoritative live view of the fleet, liveness via
//!   heartbeat timeout.
//! - **AllocationLedger**: `requestId -> Reservation` plus per-server
//!   committed rollups, guarding the capacity-safety invariant.
//! - **Strategies**: deterministic placement functions (`Balanced`,
//!   `Performance`, `Efficiency`, `Locality`, `Priority`, `FairShare`,
//!   `BestFit`).
//! - **Scheduler**: admission, candidate filtering, strategy dispatch,
//!   commit retries, and the pending-request queue.
//! - **PressureDetector**: rolling per-dimension windows, trend and anomaly
//!   detection, pressure-level classification.
//! - **Rebalancer**: shedding, evacuation, and migration in response to
//!   pressure and availability events.
//! - **AgentController**: per-agent QoS, auto-scaling, health checks.
//! - **EventBus**: bounded in-process pub/sub unifying every emitter.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod pressure;
pub mod rebalancer;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod strategy;
pub mod types;

pub use agent::{AgentController, AgentProfile};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, EventSubscription};
pub use ledger::{AllocationLedger, Reservation};
pub use pressure::PressureDetector;
pub use rebalancer::Rebalancer;
pub use registry::{ServerRegistry, ServerReport, ServerState};
pub use resource::{GpuSample, ResourceAmount, ResourceRequirement, ResourceVector};
pub use scheduler::{AllocationOutcome, AllocationRequest, Scheduler};
pub use types::{
    AgentId, Priority, PressureLevel, QosClass, RequestId, ReservationId, ReservationState,
    ServerId, ServerStatus, StrategyKind,
};

/// Convenience tracing initializer, kept for parity with the donor's
/// `init_tracing` helper but not required: a collaborator is free to wire
/// `tracing-subscriber` however it prefers.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
