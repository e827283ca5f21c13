//! FairShare-Arbiter: Joint Solver Capability
//!
//! The multi-resource problem form shared by the in-process gradient
//! solver and the subprocess-backed exact solver, and the capability trait
//! the scheduler selects between at construction time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fairshare_core::{
    Agent, ContentionGroup, JointAllocationResult, Point, ResourceBundle, ResourceType,
    UtilityFunction, EPSILON,
};

/// One agent's stake in a joint arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDemand {
    pub agent_id: String,
    /// Priority weight (base + burn)
    pub weight: f64,
    pub minimums: ResourceBundle,
    pub ideals: ResourceBundle,
    pub utility: UtilityFunction,
}

impl AgentDemand {
    pub fn from_agent(agent: &Agent, weight: f64) -> Self {
        Self {
            agent_id: agent.id.clone(),
            weight,
            minimums: agent.minimums.clone(),
            ideals: agent.ideals.clone(),
            utility: agent.utility.clone(),
        }
    }
}

/// A joint multi-resource allocation problem.
///
/// `resources` is always kept in ordinal order; every matrix derived from
/// this problem is column-aligned by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointProblem {
    pub agents: Vec<AgentDemand>,
    pub resources: Vec<ResourceType>,
    pub capacities: ResourceBundle,
}

impl JointProblem {
    /// Assemble a problem from a contention group and its members.
    pub fn from_group(
        group: &ContentionGroup,
        demands: Vec<AgentDemand>,
    ) -> Self {
        let resources: Vec<ResourceType> = group.resources.iter().copied().collect();
        Self {
            agents: demands,
            resources,
            capacities: group.available.clone(),
        }
    }

    /// Per-resource infeasibility: some resource's minimums exceed its
    /// capacity (with an epsilon of slack for float handling).
    pub fn infeasible_resource(&self) -> Option<(ResourceType, u64, u64)> {
        for &resource in &self.resources {
            let total_minimum: u64 = self.agents.iter().map(|a| a.minimums.get(resource)).sum();
            let capacity = self.capacities.get(resource);
            if total_minimum as f64 > capacity as f64 + EPSILON {
                return Some((resource, total_minimum, capacity));
            }
        }
        None
    }

    /// Weighted-log social welfare of an integer allocation map.
    pub fn welfare(&self, allocations: &BTreeMap<String, ResourceBundle>) -> f64 {
        self.agents
            .iter()
            .map(|agent| {
                let point: Point = allocations
                    .get(&agent.agent_id)
                    .map(|bundle| bundle.iter().map(|(r, q)| (r, q as f64)).collect())
                    .unwrap_or_default();
                agent.weight * agent.utility.evaluate(&point).max(EPSILON).ln()
            })
            .sum()
    }
}

/// A joint arbitrator capability: in-process approximate or
/// subprocess-backed exact, chosen at construction time.
#[async_trait]
pub trait JointArbitrator: Send + Sync {
    async fn solve(&self, problem: &JointProblem) -> JointAllocationResult;
}
