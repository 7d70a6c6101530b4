//! Shared enums and typed identifiers used across the engine (spec §3)

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(ServerId);
typed_id!(RequestId);
typed_id!(ReservationId);
typed_id!(AgentId);

/// Request priority; `Ord` derive gives `Critical > High > Normal > Low` for use
/// as the primary key of the pending-queue ordering (spec §5.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Quality-of-service class governing eviction order under pressure (spec §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QosClass {
    BestEffort,
    Burstable,
    Guaranteed,
}

impl Default for QosClass {
    fn default() -> Self {
        QosClass::Burstable
    }
}

/// Server health/availability classification (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Healthy,
    Degraded,
    Overloaded,
    Offline,
}

impl ServerStatus {
    /// Whether the registry should consider this server a placement candidate.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, ServerStatus::Healthy | ServerStatus::Degraded)
    }
}

/// Pressure classification produced by the pressure detector (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
    Emergency,
}

impl Default for PressureLevel {
    fn default() -> Self {
        PressureLevel::Normal
    }
}

/// Reservation lifecycle state (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Pending,
    Active,
    Migrating,
    Released,
}

impl ReservationState {
    /// Whether a transition into `next` is legal from `self`.
    pub fn can_transition_to(&self, next: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Released)
                | (Active, Migrating)
                | (Active, Released)
                | (Migrating, Active)
                | (Migrating, Released)
        )
    }
}

/// Which placement strategy a request should be routed through (spec §5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    Balanced,
    Performance,
    Efficiency,
    Locality,
    Priority,
    FairShare,
    BestFit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Balanced => "balanced",
            StrategyKind::Performance => "performance",
            StrategyKind::Efficiency => "efficiency",
            StrategyKind::Locality => "locality",
            StrategyKind::Priority => "priority",
            StrategyKind::FairShare => "fair_share",
            StrategyKind::BestFit => "best_fit",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(StrategyKind::Balanced),
            "performance" => Ok(StrategyKind::Performance),
            "efficiency" => Ok(StrategyKind::Efficiency),
            "locality" => Ok(StrategyKind::Locality),
            "priority" => Ok(StrategyKind::Priority),
            "fair_share" => Ok(StrategyKind::FairShare),
            "best_fit" => Ok(StrategyKind::BestFit),
            other => Err(crate::error::EngineError::StrategyUnknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn reservation_state_rejects_illegal_transition() {
        assert!(!ReservationState::Released.can_transition_to(ReservationState::Active));
        assert!(ReservationState::Pending.can_transition_to(ReservationState::Active));
    }

    #[test]
    fn strategy_kind_round_trips_through_display_and_parse() {
        for kind in [
            StrategyKind::Balanced,
            StrategyKind::Performance,
            StrategyKind::Efficiency,
            StrategyKind::Locality,
            StrategyKind::Priority,
            StrategyKind::FairShare,
            StrategyKind::BestFit,
        ] {
            let parsed: StrategyKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
