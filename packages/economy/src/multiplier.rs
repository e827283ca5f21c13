//! FairShare-Economy: Demand Multipliers
//!
//! Per-resource scarcity signal driving release earnings. The raw
//! multiplier tracks utilization directly; because allocating resources
//! lowers utilization, which lowers the incentive to release, which raises
//! utilization again, the raw signal oscillates. An EMA with alpha = 0.15
//! damps oscillations of period shorter than ~13 ticks, and the smoothed
//! value is the one the economy exposes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fairshare_core::{PoolSnapshot, ResourceType};

use crate::EconomyConfig;

/// Multiplier state for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplierState {
    /// Latest raw multiplier, 1 + 4 * utilization
    pub raw: f64,
    /// EMA-smoothed multiplier
    pub smoothed: f64,
    /// Observed utilization history, oldest first
    pub history: Vec<f64>,
}

/// EMA-smoothed demand multipliers per resource, clamped to the configured
/// range (default [1.0, 5.0]).
#[derive(Debug, Clone)]
pub struct DemandMultipliers {
    states: BTreeMap<ResourceType, MultiplierState>,
    alpha: f64,
    min: f64,
    max: f64,
}

impl DemandMultipliers {
    pub fn new(config: &EconomyConfig) -> Self {
        Self {
            states: BTreeMap::new(),
            alpha: config.alpha,
            min: config.multiplier_min,
            max: config.multiplier_max,
        }
    }

    /// Observe the pool and return the updated smoothed multiplier.
    ///
    /// Persists both the raw and smoothed values and appends to the
    /// utilization history.
    pub fn multiplier_for(&mut self, resource: ResourceType, pool: &PoolSnapshot) -> f64 {
        let utilization = pool.utilization(resource);
        let raw = (1.0 + 4.0 * utilization).clamp(self.min, self.max);

        let state = self.states.entry(resource).or_insert(MultiplierState {
            raw,
            smoothed: raw,
            history: Vec::new(),
        });

        let smoothed = (self.alpha * raw + (1.0 - self.alpha) * state.smoothed)
            .clamp(self.min, self.max);
        state.raw = raw;
        state.smoothed = smoothed;
        state.history.push(utilization);

        smoothed
    }

    /// Latest raw multiplier. Observability only; earnings always use the
    /// smoothed value.
    pub fn raw_multiplier(&self, resource: ResourceType) -> f64 {
        self.states.get(&resource).map(|s| s.raw).unwrap_or(self.min)
    }

    /// Latest smoothed multiplier without observing the pool.
    pub fn smoothed_multiplier(&self, resource: ResourceType) -> f64 {
        self.states
            .get(&resource)
            .map(|s| s.smoothed)
            .unwrap_or(self.min)
    }

    /// Utilization history for one resource, oldest first.
    pub fn history(&self, resource: ResourceType) -> &[f64] {
        self.states
            .get(&resource)
            .map(|s| s.history.as_slice())
            .unwrap_or(&[])
    }
}
