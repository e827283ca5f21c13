//! FairShare-Core: Contention Views
//!
//! Single-resource and multi-resource views of agents whose demands are
//! coupled and must be arbitrated together.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::resource::{ResourceBundle, ResourceType};

/// Agents competing over one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contention {
    /// The contested resource
    pub resource: ResourceType,
    /// Competing agent ids, in detection order
    pub agent_ids: Vec<String>,
    /// Available supply for this resource
    pub supply: u64,
}

impl Contention {
    /// Feasible iff the sum of minimums fits in the supply.
    pub fn is_feasible(&self, total_minimum: u64) -> bool {
        total_minimum <= self.supply
    }
}

/// A set of agents whose demands are coupled across one or more resources.
///
/// Created per arbitration cycle and discarded after commit or rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentionGroup {
    /// Group id, unique within one cycle
    pub id: u32,
    /// Member agent ids, in detection order
    pub agent_ids: Vec<String>,
    /// Resources any member demands
    pub resources: BTreeSet<ResourceType>,
    /// Available supply restricted to the touched resources
    pub available: ResourceBundle,
    /// Annotation set by the splitter, e.g. when a degenerate policy fell
    /// back to the unlimited one for this group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ContentionGroup {
    pub fn new(id: u32, agent_ids: Vec<String>) -> Self {
        Self {
            id,
            agent_ids,
            resources: BTreeSet::new(),
            available: ResourceBundle::new(),
            note: None,
        }
    }

    pub fn len(&self) -> usize {
        self.agent_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_ids.is_empty()
    }

    /// Joint optimization is required when several agents contend over
    /// several resources at once; single-axis groups go to water-filling.
    pub fn needs_joint(&self) -> bool {
        self.agent_ids.len() > 1 && self.resources.len() > 1
    }

    /// The single contested resource, when there is exactly one.
    pub fn single_resource(&self) -> Option<ResourceType> {
        if self.resources.len() == 1 {
            self.resources.iter().next().copied()
        } else {
            None
        }
    }
}
