//! FairShare-Core: Resource Types & Bundles
//!
//! The closed set of resource kinds the arbitrator understands, and the
//! integer quantity bundles that flow through every solver.
//!
//! The ordinal order of [`ResourceType`] is load-bearing: every matrix
//! serialized to the out-of-process solver is column-aligned by it, so the
//! enumeration is fixed within a run and iteration is always in ordinal
//! order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resource kind managed by the shared pool.
///
/// The declaration order defines the canonical ordinal used for matrix
/// column alignment. Do not reorder variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// CPU/GPU compute units
    Compute,
    /// Memory (GB)
    Memory,
    /// Persistent storage (GB)
    Storage,
    /// Network bandwidth (Mbps)
    Network,
    /// Dataset access slots
    Dataset,
    /// External API credits
    ApiCredits,
}

impl ResourceType {
    /// All resource types in canonical ordinal order.
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Compute,
        ResourceType::Memory,
        ResourceType::Storage,
        ResourceType::Network,
        ResourceType::Dataset,
        ResourceType::ApiCredits,
    ];

    /// Position in the canonical order.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Inverse of [`ordinal`](Self::ordinal).
    pub fn from_ordinal(ordinal: usize) -> Option<ResourceType> {
        Self::ALL.get(ordinal).copied()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Compute => "compute",
            ResourceType::Memory => "memory",
            ResourceType::Storage => "storage",
            ResourceType::Network => "network",
            ResourceType::Dataset => "dataset",
            ResourceType::ApiCredits => "api_credits",
        };
        f.write_str(name)
    }
}

/// A bundle of nonnegative integer quantities keyed by resource type.
///
/// Missing keys denote zero. Iteration is always in ordinal order (the
/// backing map is ordered), which keeps downstream serialization aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceBundle {
    quantities: BTreeMap<ResourceType, u64>,
}

impl ResourceBundle {
    /// Create an empty bundle (all quantities zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantity for a resource type; zero when absent.
    pub fn get(&self, resource: ResourceType) -> u64 {
        self.quantities.get(&resource).copied().unwrap_or(0)
    }

    /// Set the quantity for a resource type. Zero removes the entry.
    pub fn set(&mut self, resource: ResourceType, quantity: u64) {
        if quantity == 0 {
            self.quantities.remove(&resource);
        } else {
            self.quantities.insert(resource, quantity);
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, resource: ResourceType, quantity: u64) -> Self {
        self.set(resource, quantity);
        self
    }

    /// Add to the quantity for a resource type.
    pub fn add(&mut self, resource: ResourceType, quantity: u64) {
        if quantity > 0 {
            *self.quantities.entry(resource).or_insert(0) += quantity;
        }
    }

    /// Subtract from the quantity, saturating at zero.
    pub fn saturating_sub(&mut self, resource: ResourceType, quantity: u64) {
        let current = self.get(resource);
        self.set(resource, current.saturating_sub(quantity));
    }

    /// Sum of all quantities.
    pub fn total(&self) -> u64 {
        self.quantities.values().sum()
    }

    /// True when every quantity is zero.
    pub fn is_empty(&self) -> bool {
        self.quantities.is_empty()
    }

    /// Resource types with a nonzero quantity, in ordinal order.
    pub fn resources(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.quantities.keys().copied()
    }

    /// (type, quantity) pairs in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, u64)> + '_ {
        self.quantities.iter().map(|(r, q)| (*r, *q))
    }

    /// Merge another bundle into this one by addition.
    pub fn merge(&mut self, other: &ResourceBundle) {
        for (resource, quantity) in other.iter() {
            self.add(resource, quantity);
        }
    }

    /// Scale every quantity by an integer factor.
    pub fn scaled(&self, factor: u64) -> ResourceBundle {
        let mut out = ResourceBundle::new();
        for (resource, quantity) in self.iter() {
            out.set(resource, quantity * factor);
        }
        out
    }
}

impl FromIterator<(ResourceType, u64)> for ResourceBundle {
    fn from_iter<I: IntoIterator<Item = (ResourceType, u64)>>(iter: I) -> Self {
        let mut bundle = ResourceBundle::new();
        for (resource, quantity) in iter {
            bundle.set(resource, quantity);
        }
        bundle
    }
}

impl fmt::Display for ResourceBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (resource, quantity)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{resource}: {quantity}")?;
        }
        write!(f, "}}")
    }
}
