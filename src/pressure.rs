//! Pressure detector: rolling windows, moving averages, trend, anomaly
//! detection, and level classification (spec §4.6).
//!
//! Grounded on `knhk_consensus::gossip::convergence::ConvergenceTracker`'s
//! statistical tracking shape (bounded history, least-squares trend,
//! threshold-based state classification), adapted to per-server/per-dimension
//! windows instead of a single cluster-wide convergence metric.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus, EventSubscription};
use crate::resource::{Dimension, ResourceVector};
use crate::types::{PressureLevel, ServerId};

/// The three dimensions the spec gives explicit warn/crit thresholds for
/// (spec §6: `cpuWarnPct`/`CritPct`, `memWarnPct`/`CritPct`, `gpuWarnPct`/`CritPct`).
/// Disk and network have no configured threshold pair and are not classified.
const TRACKED_DIMENSIONS: [Dimension; 3] = [Dimension::Cpu, Dimension::Memory, Dimension::Gpu];

fn classify(value: f64, warn_pct: f64, crit_pct: f64) -> PressureLevel {
    if value >= 98.0 {
        PressureLevel::Emergency
    } else if value >= 95.0 {
        PressureLevel::Critical
    } else if value >= crit_pct {
        PressureLevel::High
    } else if value >= warn_pct {
        PressureLevel::Moderate
    } else {
        PressureLevel::Normal
    }
}

struct DimensionWindow {
    samples: VecDeque<(i64, f64)>,
    capacity: usize,
}

impl DimensionWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, timestamp_nanos: i64, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp_nanos, value));
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64
    }

    fn stddev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt()
    }

    /// Least-squares slope of value over sample index (not wall-clock time,
    /// so evenly-spaced samples give a stable "per-sample" rate).
    fn trend_slope(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let x_mean = xs.iter().sum::<f64>() / n as f64;
        let y_mean = self.mean();

        let mut num = 0.0;
        let mut den = 0.0;
        for (i, (_, v)) in self.samples.iter().enumerate() {
            let dx = xs[i] - x_mean;
            num += dx * (v - y_mean);
            den += dx * dx;
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }

    fn is_anomaly(&self, latest: f64) -> bool {
        let sigma = self.stddev();
        if sigma == 0.0 {
            return false;
        }
        (latest - self.mean()).abs() > 2.0 * sigma
    }

    fn last_value(&self) -> f64 {
        self.samples.back().map(|(_, v)| *v).unwrap_or(0.0)
    }
}

struct ServerPressureState {
    windows: HashMap<Dimension, DimensionWindow>,
    last_alert: HashMap<Dimension, (PressureLevel, i64)>,
}

impl ServerPressureState {
    fn new(capacity: usize) -> Self {
        Self {
            windows: TRACKED_DIMENSIONS
                .iter()
                .map(|d| (*d, DimensionWindow::new(capacity)))
                .collect(),
            last_alert: HashMap::new(),
        }
    }
}

/// A point-in-time read of one server's pressure across tracked dimensions.
#[derive(Debug, Clone)]
pub struct PressureSnapshot {
    pub server_id: ServerId,
    pub per_dimension_level: HashMap<Dimension, PressureLevel>,
    pub overall_level: PressureLevel,
}

pub struct PressureDetector {
    state: DashMap<ServerId, ServerPressureState>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl PressureDetector {
    pub fn new(config: EngineConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            state: DashMap::new(),
            config,
            event_bus,
        }
    }

    fn thresholds_for(&self, dim: Dimension) -> (f64, f64) {
        match dim {
            Dimension::Cpu => (self.config.cpu_warn_pct, self.config.cpu_crit_pct),
            Dimension::Memory => (self.config.mem_warn_pct, self.config.mem_crit_pct),
            Dimension::Gpu => (self.config.gpu_warn_pct, self.config.gpu_crit_pct),
            Dimension::Disk | Dimension::Network => (100.0, 100.0),
        }
    }

    /// Feed a new resource sample for `server_id`. Returns the resulting
    /// overall (max-over-dimensions) pressure level.
    #[instrument(skip(self, resources), fields(server_id = %server_id))]
    pub fn record_sample(
        &self,
        server_id: ServerId,
        timestamp_nanos: i64,
        resources: &ResourceVector,
    ) -> PressureLevel {
        let mut entry = self
            .state
            .entry(server_id.clone())
            .or_insert_with(|| ServerPressureState::new(self.config.pressure_window_samples));

        let mut overall = PressureLevel::Normal;

        for dim in TRACKED_DIMENSIONS {
            let value = resources.utilization_of(dim);
            let window = entry.windows.get_mut(&dim).expect("tracked dimension always present");

            if window.is_anomaly(value) {
                warn!(server_id = %server_id, ?dim, value, "pressure sample is an anomaly (>2 sigma)");
            }
            window.push(timestamp_nanos, value);

            let (warn_pct, crit_pct) = self.thresholds_for(dim);
            let level = classify(value, warn_pct, crit_pct);
            overall = overall.max(level);

            let cooldown_nanos = self.config.alert_cooldown_ms as i64 * 1_000_000;
            let should_emit = match entry.last_alert.get(&dim) {
                Some((last_level, last_at)) => {
                    *last_level != level || timestamp_nanos - last_at >= cooldown_nanos
                }
                None => true,
            };

            if should_emit {
                entry.last_alert.insert(dim, (level, timestamp_nanos));
                self.event_bus.publish(EngineEvent::PressureLevelChanged {
                    server_id: server_id.clone(),
                    dimension: dim,
                    new_level: level,
                });
            }
        }

        overall
    }

    pub fn analyze(&self, server_id: &ServerId) -> Option<PressureSnapshot> {
        let entry = self.state.get(server_id)?;
        let per_dimension_level = TRACKED_DIMENSIONS
            .iter()
            .map(|dim| {
                let window = &entry.windows[dim];
                let (warn_pct, crit_pct) = self.thresholds_for(*dim);
                (*dim, classify(window.last_value(), warn_pct, crit_pct))
            })
            .collect::<HashMap<_, _>>();
        let overall_level = per_dimension_level
            .values()
            .copied()
            .max()
            .unwrap_or(PressureLevel::Normal);
        Some(PressureSnapshot {
            server_id: server_id.clone(),
            per_dimension_level,
            overall_level,
        })
    }

    /// Linear-trend prediction: `lastValue + slope * steps`, clamped to
    /// `[0, 100]` (spec §4.6).
    pub fn predict(&self, server_id: &ServerId, dimension: Dimension, horizon_steps: f64) -> Option<f64> {
        let entry = self.state.get(server_id)?;
        let window = entry.windows.get(&dimension)?;
        let predicted = window.last_value() + window.trend_slope() * horizon_steps;
        Some(predicted.clamp(0.0, 100.0))
    }

    /// Subscribe to the shared event bus (spec: unified event emission,
    /// §4.6 `subscribe(listener)`). Callers filter for `PressureLevelChanged`.
    pub fn subscribe(&self) -> EventSubscription {
        self.event_bus.subscribe()
    }
}
