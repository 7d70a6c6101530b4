//! Engine configuration (spec §6, §10.3)

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::StrategyKind;

/// Configuration accepted by the core. File/env parsing is explicitly out of
/// scope (spec §1) — a collaborator builds this struct however it likes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub heartbeat_interval_ms: u64,
    pub offline_timeout_ms: u64,

    pub cpu_warn_pct: f64,
    pub cpu_crit_pct: f64,
    pub mem_warn_pct: f64,
    pub mem_crit_pct: f64,
    pub gpu_warn_pct: f64,
    pub gpu_crit_pct: f64,

    pub default_strategy: StrategyKind,
    pub max_commit_retries: u32,
    pub event_buffer_size: usize,
    pub pressure_window_samples: usize,
    pub alert_cooldown_ms: u64,
    pub rebalance_shed_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            offline_timeout_ms: 30_000,
            cpu_warn_pct: 80.0,
            cpu_crit_pct: 90.0,
            mem_warn_pct: 85.0,
            mem_crit_pct: 95.0,
            gpu_warn_pct: 90.0,
            gpu_crit_pct: 95.0,
            default_strategy: StrategyKind::Balanced,
            max_commit_retries: 3,
            event_buffer_size: 1024,
            pressure_window_samples: 100,
            alert_cooldown_ms: 60_000,
            rebalance_shed_fraction: 0.30,
        }
    }
}

impl EngineConfig {
    /// Validate cross-field invariants before the engine is constructed
    /// (mirrors `SwarmConfig::validate`/`ConsensusConfig::validate`).
    pub fn validate(&self) -> EngineResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.offline_timeout_ms < self.heartbeat_interval_ms {
            return Err(EngineError::InvalidConfig(
                "offline_timeout_ms must be >= heartbeat_interval_ms".into(),
            ));
        }
        Self::validate_threshold_pair("cpu", self.cpu_warn_pct, self.cpu_crit_pct)?;
        Self::validate_threshold_pair("mem", self.mem_warn_pct, self.mem_crit_pct)?;
        Self::validate_threshold_pair("gpu", self.gpu_warn_pct, self.gpu_crit_pct)?;

        if self.max_commit_retries == 0 {
            return Err(EngineError::InvalidConfig(
                "max_commit_retries must be > 0".into(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(EngineError::InvalidConfig(
                "event_buffer_size must be > 0".into(),
            ));
        }
        if self.pressure_window_samples < 2 {
            return Err(EngineError::InvalidConfig(
                "pressure_window_samples must be >= 2 to compute a trend".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rebalance_shed_fraction) {
            return Err(EngineError::InvalidConfig(
                "rebalance_shed_fraction must be in [0,1]".into(),
            ));
        }
        Ok(())
    }

    fn validate_threshold_pair(name: &str, warn: f64, crit: f64) -> EngineResult<()> {
        if !(0.0..=100.0).contains(&warn) || !(0.0..=100.0).contains(&crit) {
            return Err(EngineError::InvalidConfig(format!(
                "{name} thresholds must be in [0,100]"
            )));
        }
        if warn >= crit {
            return Err(EngineError::InvalidConfig(format!(
                "{name}_warn_pct must be < {name}_crit_pct"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_warn_above_crit() {
        let mut cfg = EngineConfig::default();
        cfg.cpu_warn_pct = 95.0;
        cfg.cpu_crit_pct = 90.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_offline_timeout_shorter_than_heartbeat() {
        let mut cfg = EngineConfig::default();
        cfg.offline_timeout_ms = 1_000;
        cfg.heartbeat_interval_ms = 10_000;
        assert!(cfg.validate().is_err());
    }
}
