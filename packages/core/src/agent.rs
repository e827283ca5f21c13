//! FairShare-Core: Agents
//!
//! An agent is a workload competing for the shared pool: per-resource
//! minimum and ideal demands, a utility function over allocations, and a
//! priority-currency balance it can burn to raise its weight for a cycle.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::resource::{ResourceBundle, ResourceType};
use crate::utility::UtilityFunction;

/// A workload competing for pool resources.
///
/// Invariants after any committed transaction:
/// - `minimum <= allocation <= ideal` per resource
/// - `balance >= floor` (zero unless explicit debt is enabled)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identity
    pub id: String,
    /// Display name
    pub name: String,
    /// Guaranteed floor per resource (the outside option)
    pub minimums: ResourceBundle,
    /// Demand ceiling per resource
    pub ideals: ResourceBundle,
    /// Valuation of allocations
    pub utility: UtilityFunction,
    /// Current committed allocation
    pub allocation: ResourceBundle,
    /// Priority-currency balance
    pub balance: Decimal,
    /// Currency burned for the current cycle (spent, not transferred)
    pub burn: Decimal,
}

impl Agent {
    /// Create an agent with no demands, a uniform linear utility, and an
    /// empty balance. Flesh out with the `with_*` builders.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            minimums: ResourceBundle::new(),
            ideals: ResourceBundle::new(),
            utility: UtilityFunction::uniform_linear(&ResourceType::ALL),
            allocation: ResourceBundle::new(),
            balance: Decimal::ZERO,
            burn: Decimal::ZERO,
        }
    }

    /// Declare a min/ideal demand for one resource.
    pub fn with_demand(mut self, resource: ResourceType, minimum: u64, ideal: u64) -> Self {
        self.minimums.set(resource, minimum);
        self.ideals.set(resource, ideal);
        self
    }

    pub fn with_utility(mut self, utility: UtilityFunction) -> Self {
        self.utility = utility;
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_burn(mut self, burn: Decimal) -> Self {
        self.burn = burn;
        self
    }

    /// Check the structural invariants (`0 <= min <= ideal` per resource).
    pub fn validate(&self) -> Result<(), AgentError> {
        for resource in ResourceType::ALL {
            let minimum = self.minimums.get(resource);
            let ideal = self.ideals.get(resource);
            if minimum > ideal {
                return Err(AgentError::InvalidDemand {
                    agent_id: self.id.clone(),
                    resource,
                    minimum,
                    ideal,
                });
            }
        }
        Ok(())
    }

    /// Resource types this agent demands at all (ideal > 0).
    pub fn demanded_resources(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.ideals.resources()
    }

    /// True when the agent wants any amount of the resource.
    pub fn demands(&self, resource: ResourceType) -> bool {
        self.ideals.get(resource) > 0
    }

    pub fn minimum(&self, resource: ResourceType) -> u64 {
        self.minimums.get(resource)
    }

    pub fn ideal(&self, resource: ResourceType) -> u64 {
        self.ideals.get(resource)
    }

    /// Point-in-time copy of the mutable state, for transaction snapshots.
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.id.clone(),
            allocation: self.allocation.clone(),
            balance: self.balance,
        }
    }

    /// Restore mutable state from a snapshot. Rollback path; never fails.
    pub fn restore(&mut self, snapshot: &AgentSnapshot) {
        self.allocation = snapshot.allocation.clone();
        self.balance = snapshot.balance;
    }
}

/// Frozen allocation + balance for one agent inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub allocation: ResourceBundle,
    pub balance: Decimal,
}
