//! FairShare-Arbiter: Scenario Configuration
//!
//! The typed form of a scenario: pool capacities, agent descriptors,
//! optional grouping policy, and the arbitration mechanism. Loaders
//! (YAML, script harnesses) live outside the kernel and produce this.
//! Unknown keys are rejected everywhere; the recognized options are
//! enumerated, nothing is inferred.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fairshare_core::{
    Agent, AgentError, ResourceBundle, ResourcePool, ResourceType, UtilityError, UtilityFunction,
};
use fairshare_economy::{EconomyConfig, EconomyError};

use crate::convex::ConvexSolverConfig;
use crate::grouping::{GroupingPolicy, PolicyError};

/// Which arbitrator runs the multi-resource groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Sequential per-resource water-filling
    #[default]
    ProportionalFairness,
    /// In-process projected gradient ascent
    GradientJoint,
    /// Out-of-process exact solver with gradient fallback
    ConvexJoint,
}

/// One agent's descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub minimums: BTreeMap<ResourceType, u64>,
    pub ideals: BTreeMap<ResourceType, u64>,
    pub utility: UtilityFunction,
    pub initial_currency: Decimal,
}

impl AgentSpec {
    pub fn build(&self) -> Agent {
        let mut agent = Agent::new(&self.id, &self.name)
            .with_utility(self.utility.clone())
            .with_balance(self.initial_currency);
        for (&resource, &ideal) in &self.ideals {
            let minimum = self.minimums.get(&resource).copied().unwrap_or(0);
            agent = agent.with_demand(resource, minimum, ideal);
        }
        agent
    }
}

/// A full scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    /// Capacity per resource type
    pub pool: BTreeMap<ResourceType, u64>,
    /// Defaults to the unlimited policy
    #[serde(default)]
    pub policy: Option<GroupingPolicy>,
    pub agents: Vec<AgentSpec>,
    /// Defaults to proportional fairness
    #[serde(default)]
    pub mechanism: Mechanism,
    /// Economy constants, defaulted
    #[serde(default)]
    pub economy: EconomyConfig,
    /// Required when the mechanism is `convex_joint`
    #[serde(default)]
    pub convex_solver: Option<ConvexSolverConfig>,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate agent id: {agent_id}")]
    DuplicateAgent { agent_id: String },

    #[error("agent {agent_id}: {source}")]
    InvalidUtility {
        agent_id: String,
        source: UtilityError,
    },

    #[error(transparent)]
    InvalidAgent(#[from] AgentError),

    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),

    #[error(transparent)]
    InvalidEconomy(#[from] EconomyError),

    #[error("mechanism convex_joint requires a convex_solver section")]
    MissingSolver,
}

impl ScenarioSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(policy) = &self.policy {
            policy.validate()?;
        }
        self.economy.validate()?;
        if self.mechanism == Mechanism::ConvexJoint && self.convex_solver.is_none() {
            return Err(ConfigError::MissingSolver);
        }

        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.agents {
            if !seen.insert(&spec.id) {
                return Err(ConfigError::DuplicateAgent {
                    agent_id: spec.id.clone(),
                });
            }
            spec.utility
                .validate()
                .map_err(|source| ConfigError::InvalidUtility {
                    agent_id: spec.id.clone(),
                    source,
                })?;
            spec.build().validate()?;
        }
        Ok(())
    }

    pub fn build_pool(&self) -> ResourcePool {
        ResourcePool::new(self.pool.iter().map(|(&r, &q)| (r, q)).collect::<ResourceBundle>())
    }

    pub fn build_agents(&self) -> Result<BTreeMap<String, Agent>, ConfigError> {
        self.validate()?;
        Ok(self
            .agents
            .iter()
            .map(|spec| (spec.id.clone(), spec.build()))
            .collect())
    }
}
