//! In-process event bus: bounded pub/sub with a "drop oldest" overflow policy
//! (spec §5 Suspension points, §6 Outputs published, §9 "event emitters
//! everywhere" unification).
//!
//! Grounded on `tokio::sync::broadcast`, whose ring-buffer semantics already
//! give "oldest event dropped when a lagging subscriber falls behind" for
//! free; the sender side never blocks on a slow subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::resource::{Dimension, ResourceVector};
use crate::types::{PressureLevel, ServerId, ServerStatus};

/// Why a reservation was released (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    Client,
    Evicted,
    MigrationFailed,
}

/// Why an allocation attempt failed, expressed independently of `EngineError`
/// so the event payload stays a stable, serializable shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AllocationFailureReason {
    InvalidRequest(String),
    NoCapacity { shortage: ResourceVector },
    StrategyUnknown(String),
    Cancelled,
}

impl From<&EngineError> for AllocationFailureReason {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::InvalidRequest(msg) => AllocationFailureReason::InvalidRequest(msg.clone()),
            EngineError::NoCapacity { shortage } => AllocationFailureReason::NoCapacity {
                shortage: shortage.clone(),
            },
            EngineError::StrategyUnknown(name) => AllocationFailureReason::StrategyUnknown(name.clone()),
            EngineError::Cancelled => AllocationFailureReason::Cancelled,
            other => AllocationFailureReason::InvalidRequest(other.to_string()),
        }
    }
}

/// The stable set of event shapes published on the bus (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    ServerStateChanged {
        server_id: ServerId,
        old_status: ServerStatus,
        new_status: ServerStatus,
        generation: u64,
    },
    AllocationCommitted {
        request_id: String,
        server_id: ServerId,
        granted: ResourceVector,
    },
    AllocationQueued {
        request_id: String,
        position: usize,
    },
    AllocationFailed {
        request_id: String,
        reason: AllocationFailureReason,
    },
    Released {
        request_id: String,
        reason: ReleaseReason,
    },
    PressureLevelChanged {
        server_id: ServerId,
        dimension: Dimension,
        new_level: PressureLevel,
    },
    AgentMigrated {
        agent_id: String,
        from_server_id: ServerId,
        to_server_id: ServerId,
    },
    AgentUnhealthy {
        agent_id: String,
    },
}

/// Bounded, multi-producer multi-consumer event bus.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; if there are currently no subscribers
    /// the event is simply discarded (not counted as a drop — that counter is
    /// reserved for lagging subscribers losing backlog).
    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "publishing event");
        let _ = self.sender.send(event);
    }

    /// Subscribe for events from this point forward.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            dropped_events: self.dropped_events.clone(),
        }
    }

    /// Total events lost to lagging subscribers across the bus's lifetime.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscription handle. Wraps the raw broadcast receiver so that lag
/// (the overflow case) is transparently folded into `dropped_events` instead
/// of being surfaced as an error the caller must special-case.
pub struct EventSubscription {
    receiver: broadcast::Receiver<EngineEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl EventSubscription {
    /// Await the next event, skipping past any lag transparently. Returns
    /// `None` once the bus itself has been dropped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, oldest events dropped");
                    self.dropped_events.fetch_add(missed, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        bus.publish(EngineEvent::AgentUnhealthy {
            agent_id: "agent-1".into(),
        });
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::AgentUnhealthy { .. }));
    }

    #[tokio::test]
    async fn overflow_increments_dropped_events_counter() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..10 {
            bus.publish(EngineEvent::AgentUnhealthy {
                agent_id: format!("agent-{i}"),
            });
        }
        // Drain; lag should have been recorded for the slow subscriber.
        while tokio::time::timeout(std::time::Duration::from_millis(10), sub.recv())
            .await
            .is_ok()
        {}
        assert!(bus.dropped_events() > 0);
    }
}
