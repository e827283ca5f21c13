//! FairShare-Core: Allocation Results
//!
//! Value objects handed back to the scheduler after arbitration. A result
//! is never partially committed: infeasible problems produce a
//! distinguished non-feasible result and leave all state untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::resource::ResourceBundle;

/// Result of a single-resource arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Integer allocation per agent id
    pub allocations: BTreeMap<String, u64>,
    /// Weighted-log objective at the solution
    pub objective: f64,
    /// False when the minimums alone exceed supply
    pub feasible: bool,
    /// Human-readable outcome, including which solver path ran
    pub message: String,
    /// Solve wall time
    pub elapsed: Duration,
}

impl AllocationResult {
    /// Distinguished infeasible result; carries no allocations.
    pub fn infeasible(message: impl Into<String>) -> Self {
        Self {
            allocations: BTreeMap::new(),
            objective: f64::NEG_INFINITY,
            feasible: false,
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Result of a joint multi-resource arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointAllocationResult {
    /// Integer allocation bundle per agent id
    pub allocations: BTreeMap<String, ResourceBundle>,
    /// Weighted-log social welfare at the solution
    pub objective: f64,
    /// False when any resource's minimums exceed its supply
    pub feasible: bool,
    /// Human-readable outcome, including which solver path ran
    pub message: String,
    /// Solve wall time
    pub elapsed: Duration,
}

impl JointAllocationResult {
    /// Distinguished infeasible result; carries no allocations.
    pub fn infeasible(message: impl Into<String>) -> Self {
        Self {
            allocations: BTreeMap::new(),
            objective: f64::NEG_INFINITY,
            feasible: false,
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    /// Total allocated per resource across all agents.
    pub fn totals(&self) -> ResourceBundle {
        let mut totals = ResourceBundle::new();
        for bundle in self.allocations.values() {
            totals.merge(bundle);
        }
        totals
    }
}
