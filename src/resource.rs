//! Resource domain types and arithmetic (spec §3, §4.1)
//!
//! `ResourceVector` is the fundamental numeric type shared by server capacity,
//! committed/granted rollups, and live reports. All arithmetic here is total:
//! nothing panics on a negative result, saturation is reported as a flag.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A single GPU's resource state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub utilization_percent: f64,
}

impl GpuSample {
    pub fn validate(&self) -> EngineResult<()> {
        if self.memory_used_bytes > self.memory_total_bytes {
            return Err(EngineError::InvalidRequest(format!(
                "gpu memory_used_bytes ({}) exceeds memory_total_bytes ({})",
                self.memory_used_bytes, self.memory_total_bytes
            )));
        }
        if !(0.0..=100.0).contains(&self.utilization_percent) {
            return Err(EngineError::InvalidRequest(format!(
                "gpu utilization_percent out of [0,100]: {}",
                self.utilization_percent
            )));
        }
        Ok(())
    }

    fn available_memory_bytes(&self) -> u64 {
        self.memory_total_bytes.saturating_sub(self.memory_used_bytes)
    }
}

/// Dimensions tracked for pressure classification and weighted load scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
    Network,
    Gpu,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Cpu,
        Dimension::Memory,
        Dimension::Disk,
        Dimension::Network,
        Dimension::Gpu,
    ];
}

/// Weights applied per dimension when collapsing a `ResourceVector` into a
/// single scalar load figure (used by the `Balanced` and `BestFit` strategies).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadWeights {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        // spec §4.4 Balanced: 0.4 cpu + 0.4 mem + 0.2 gpu
        Self {
            cpu: 0.4,
            memory: 0.4,
            gpu: 0.2,
        }
    }
}

/// The fundamental numeric type: a vector of CPU/Mem/Disk/Net/GPU quantities
/// plus an opaque capability set. Used for server capacity, live reports,
/// committed/granted rollups, and as a loose "amount" when a single quantity
/// needs expressing in the same units as capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu_cores: f64,
    pub cpu_usage_percent: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub network_bandwidth_bps: u64,
    pub network_latency_micros: u64,
    pub gpus: Vec<GpuSample>,
    pub capabilities: BTreeSet<String>,
}

impl Default for ResourceVector {
    fn default() -> Self {
        Self::zero()
    }
}

impl ResourceVector {
    /// The additive/subtractive identity.
    pub fn zero() -> Self {
        Self {
            cpu_cores: 0.0,
            cpu_usage_percent: 0.0,
            memory_total_bytes: 0,
            memory_used_bytes: 0,
            disk_total_bytes: 0,
            disk_used_bytes: 0,
            network_bandwidth_bps: 0,
            network_latency_micros: 0,
            gpus: Vec::new(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Validate the invariants from spec §3: no negative field, used <= total,
    /// utilization in [0, 100].
    pub fn validate(&self) -> EngineResult<()> {
        if self.cpu_cores < 0.0 {
            return Err(EngineError::InvalidRequest("cpu_cores is negative".into()));
        }
        if !(0.0..=100.0).contains(&self.cpu_usage_percent) {
            return Err(EngineError::InvalidRequest(
                "cpu_usage_percent out of [0,100]".into(),
            ));
        }
        if self.memory_used_bytes > self.memory_total_bytes {
            return Err(EngineError::InvalidRequest(
                "memory_used_bytes exceeds memory_total_bytes".into(),
            ));
        }
        if self.disk_used_bytes > self.disk_total_bytes {
            return Err(EngineError::InvalidRequest(
                "disk_used_bytes exceeds disk_total_bytes".into(),
            ));
        }
        for gpu in &self.gpus {
            gpu.validate()?;
        }
        Ok(())
    }

    pub fn available_memory_bytes(&self) -> u64 {
        self.memory_total_bytes.saturating_sub(self.memory_used_bytes)
    }

    pub fn available_disk_bytes(&self) -> u64 {
        self.disk_total_bytes.saturating_sub(self.disk_used_bytes)
    }

    pub fn available_gpu_memory_bytes(&self) -> u64 {
        self.gpus.iter().map(GpuSample::available_memory_bytes).sum()
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    fn mean_gpu_utilization_percent(&self) -> f64 {
        if self.gpus.is_empty() {
            return 0.0;
        }
        self.gpus.iter().map(|g| g.utilization_percent).sum::<f64>() / self.gpus.len() as f64
    }

    /// Utilization percentage for a single dimension, for pressure classification.
    pub fn utilization_of(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Cpu => self.cpu_usage_percent,
            Dimension::Memory => {
                if self.memory_total_bytes == 0 {
                    0.0
                } else {
                    100.0 * self.memory_used_bytes as f64 / self.memory_total_bytes as f64
                }
            }
            Dimension::Disk => {
                if self.disk_total_bytes == 0 {
                    0.0
                } else {
                    100.0 * self.disk_used_bytes as f64 / self.disk_total_bytes as f64
                }
            }
            Dimension::Network => {
                // No fixed "total" bandwidth budget is tracked on the vector itself;
                // latency is reported directly and is not a utilization percentage.
                // Callers that need network pressure compare `network_latency_micros`
                // against a configured ceiling instead of calling this branch.
                0.0
            }
            Dimension::Gpu => {
                let mem_pct = if self.available_gpu_memory_bytes() == 0 && self.gpu_count() == 0 {
                    0.0
                } else {
                    let total: u64 = self.gpus.iter().map(|g| g.memory_total_bytes).sum();
                    let used: u64 = self.gpus.iter().map(|g| g.memory_used_bytes).sum();
                    if total == 0 {
                        0.0
                    } else {
                        100.0 * used as f64 / total as f64
                    }
                };
                self.mean_gpu_utilization_percent().max(mem_pct)
            }
        }
    }

    /// Collapse this vector into a single scalar load figure, 0.0-ish to 1.0-ish
    /// (can exceed 1.0 under over-commit, which is intentional: strategies use
    /// it only for relative ranking, not as a fraction).
    pub fn weighted_load(&self, weights: LoadWeights) -> f64 {
        let cpu = self.cpu_usage_percent / 100.0;
        let mem = if self.memory_total_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 / self.memory_total_bytes as f64
        };
        let gpu = self.mean_gpu_utilization_percent() / 100.0;
        weights.cpu * cpu + weights.memory * mem + weights.gpu * gpu
    }

    /// Total-aware add: totals and usages both accumulate (used when merging
    /// two capacity-shaped vectors, e.g. summing per-dimension committed amounts).
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            cpu_usage_percent: (self.cpu_usage_percent + other.cpu_usage_percent).min(100.0),
            memory_total_bytes: self.memory_total_bytes + other.memory_total_bytes,
            memory_used_bytes: self.memory_used_bytes + other.memory_used_bytes,
            disk_total_bytes: self.disk_total_bytes + other.disk_total_bytes,
            disk_used_bytes: self.disk_used_bytes + other.disk_used_bytes,
            network_bandwidth_bps: self.network_bandwidth_bps + other.network_bandwidth_bps,
            network_latency_micros: self.network_latency_micros.max(other.network_latency_micros),
            gpus: {
                let mut gpus = self.gpus.clone();
                gpus.extend(other.gpus.iter().cloned());
                gpus
            },
            capabilities: self.capabilities.union(&other.capabilities).cloned().collect(),
        }
    }

    /// Saturating subtract: every field clamps at zero instead of underflowing.
    /// Returns the result plus a flag that is `true` if any field would have
    /// gone negative (the scheduler treats this as over-commit detection).
    pub fn subtract_saturating(&self, other: &ResourceVector) -> (ResourceVector, bool) {
        let mut underflow = false;

        let mut sub_f64 = |a: f64, b: f64| -> f64 {
            if b > a {
                underflow = true;
            }
            (a - b).max(0.0)
        };
        let cpu_cores = sub_f64(self.cpu_cores, other.cpu_cores);

        let mut sub_u64 = |a: u64, b: u64| -> u64 {
            if b > a {
                underflow = true;
            }
            a.saturating_sub(b)
        };
        let memory_used_bytes = sub_u64(self.memory_used_bytes, other.memory_used_bytes);
        let disk_used_bytes = sub_u64(self.disk_used_bytes, other.disk_used_bytes);
        let network_bandwidth_bps =
            sub_u64(self.network_bandwidth_bps, other.network_bandwidth_bps);

        let result = ResourceVector {
            cpu_cores,
            cpu_usage_percent: self.cpu_usage_percent,
            memory_total_bytes: self.memory_total_bytes,
            memory_used_bytes,
            disk_total_bytes: self.disk_total_bytes,
            disk_used_bytes,
            network_bandwidth_bps,
            network_latency_micros: self.network_latency_micros,
            gpus: self.gpus.clone(),
            capabilities: self.capabilities.clone(),
        };

        (result, underflow)
    }

    /// Capacity still free on `self` once `committed` is carved out of it.
    ///
    /// `self` is capacity-shaped (real totals, real current usage); `committed`
    /// is a granted-amount rollup built via [`ResourceVector::from_amount`] and
    /// summed with [`ResourceVector::add`] — its `*_used_bytes` fields hold an
    /// *amount reserved*, not a second usage reading. `cpu_cores` and
    /// `network_bandwidth_bps` have no separate total/used split on either side
    /// (the field itself is the free quantity), so a grant subtracts directly.
    /// `memory`/`disk`/`gpu` do carry a total/used pair, so a grant is layered
    /// on top of the already-reported usage before comparing to the total.
    /// Returns the flag set if any dimension's commitments exceed its capacity.
    pub fn available_given(&self, committed: &ResourceVector) -> (ResourceVector, bool) {
        let mut underflow = false;

        let cpu_cores = if committed.cpu_cores > self.cpu_cores {
            underflow = true;
            0.0
        } else {
            self.cpu_cores - committed.cpu_cores
        };

        let network_bandwidth_bps = if committed.network_bandwidth_bps > self.network_bandwidth_bps {
            underflow = true;
            0
        } else {
            self.network_bandwidth_bps - committed.network_bandwidth_bps
        };

        let memory_used_bytes = self.memory_used_bytes.saturating_add(committed.memory_used_bytes);
        if memory_used_bytes > self.memory_total_bytes {
            underflow = true;
        }
        let disk_used_bytes = self.disk_used_bytes.saturating_add(committed.disk_used_bytes);
        if disk_used_bytes > self.disk_total_bytes {
            underflow = true;
        }

        // Committed GPU memory isn't tied to any particular real GPU (from_amount
        // splits it evenly across synthetic samples), so fold the committed total
        // into the first GPU's usage and let available_gpu_memory_bytes() track
        // the aggregate. A commitment against a server with no GPUs is itself an
        // over-commit.
        let committed_gpu_used: u64 = committed.gpus.iter().map(|g| g.memory_used_bytes).sum();
        let mut gpus = self.gpus.clone();
        if committed_gpu_used > 0 {
            if let Some(first) = gpus.first_mut() {
                let new_used = first.memory_used_bytes.saturating_add(committed_gpu_used);
                if new_used > first.memory_total_bytes {
                    underflow = true;
                }
                first.memory_used_bytes = new_used.min(first.memory_total_bytes);
            } else {
                underflow = true;
            }
        }

        let result = ResourceVector {
            cpu_cores,
            cpu_usage_percent: self.cpu_usage_percent,
            memory_total_bytes: self.memory_total_bytes,
            memory_used_bytes: memory_used_bytes.min(self.memory_total_bytes),
            disk_total_bytes: self.disk_total_bytes,
            disk_used_bytes: disk_used_bytes.min(self.disk_total_bytes),
            network_bandwidth_bps,
            network_latency_micros: self.network_latency_micros,
            gpus,
            capabilities: self.capabilities.clone(),
        };

        (result, underflow)
    }

    /// `true` iff every minimum requested quantity is <= the corresponding
    /// available quantity on `self`, and every required capability is present.
    pub fn meets(&self, requirement: &ResourceAmount) -> bool {
        if self.cpu_cores < requirement.cpu_cores {
            return false;
        }
        if self.available_memory_bytes() < requirement.memory_bytes {
            return false;
        }
        if self.available_disk_bytes() < requirement.disk_bytes {
            return false;
        }
        if self.network_bandwidth_bps < requirement.network_bandwidth_bps {
            return false;
        }
        if (self.gpu_count() as u32) < requirement.gpu_count {
            return false;
        }
        if self.available_gpu_memory_bytes() < requirement.gpu_memory_bytes {
            return false;
        }
        requirement.capabilities.is_subset(&self.capabilities)
    }

    /// Build a capacity-shaped `ResourceVector` out of a flat "amount" requirement,
    /// used when a granted amount needs to be expressed/subtracted in the same
    /// shape as server capacity.
    pub fn from_amount(amount: &ResourceAmount) -> ResourceVector {
        ResourceVector {
            cpu_cores: amount.cpu_cores,
            cpu_usage_percent: 0.0,
            memory_total_bytes: 0,
            memory_used_bytes: amount.memory_bytes,
            disk_total_bytes: 0,
            disk_used_bytes: amount.disk_bytes,
            network_bandwidth_bps: amount.network_bandwidth_bps,
            network_latency_micros: 0,
            gpus: (0..amount.gpu_count)
                .map(|_| GpuSample {
                    memory_total_bytes: 0,
                    memory_used_bytes: amount
                        .gpu_memory_bytes
                        .checked_div(amount.gpu_count.max(1) as u64)
                        .unwrap_or(0),
                    utilization_percent: 0.0,
                })
                .collect(),
            capabilities: amount.capabilities.clone(),
        }
    }
}

/// A requested (not yet granted) quantity: what a caller asks for, expressed
/// independently of any particular server's capacity shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bandwidth_bps: u64,
    pub gpu_count: u32,
    pub gpu_memory_bytes: u64,
    pub capabilities: BTreeSet<String>,
}

impl ResourceAmount {
    pub fn validate(&self) -> EngineResult<()> {
        if self.cpu_cores < 0.0 {
            return Err(EngineError::InvalidRequest("cpu_cores is negative".into()));
        }
        if self.memory_bytes == 0 {
            return Err(EngineError::InvalidRequest(
                "memory_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Minimum plus preferred resource amounts, bundled the way `AllocationRequest`
/// and `Reservation` carry them (spec §3: "requested: minimums + preferreds").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub minimum: ResourceAmount,
    pub preferred: ResourceAmount,
}

impl ResourceRequirement {
    pub fn validate(&self) -> EngineResult<()> {
        self.minimum.validate()?;
        if self.preferred.cpu_cores < self.minimum.cpu_cores
            || self.preferred.memory_bytes < self.minimum.memory_bytes
        {
            return Err(EngineError::InvalidRequest(
                "preferred amount must be >= minimum amount".into(),
            ));
        }
        Ok(())
    }
}
