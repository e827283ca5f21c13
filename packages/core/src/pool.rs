//! FairShare-Core: Resource Pool
//!
//! Process-wide capacity and availability per resource type. The pool is
//! owned by the scheduler for the process lifetime; arbitrators only ever
//! see a read-only [`PoolSnapshot`], and the commit path is the single
//! writer.

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::resource::{ResourceBundle, ResourceType};

/// Shared capacity state: total and currently-available quantity per type.
///
/// Invariant: `0 <= available <= total` for every resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePool {
    total: ResourceBundle,
    available: ResourceBundle,
}

impl ResourcePool {
    /// Create a pool with the given capacities, fully available.
    pub fn new(capacities: ResourceBundle) -> Self {
        Self {
            available: capacities.clone(),
            total: capacities,
        }
    }

    /// Total capacity for a resource.
    pub fn total(&self, resource: ResourceType) -> u64 {
        self.total.get(resource)
    }

    /// Currently available quantity for a resource.
    pub fn available(&self, resource: ResourceType) -> u64 {
        self.available.get(resource)
    }

    /// Fraction of capacity in use, in [0, 1]. Zero-capacity resources
    /// report zero utilization.
    pub fn utilization(&self, resource: ResourceType) -> f64 {
        let total = self.total.get(resource);
        if total == 0 {
            return 0.0;
        }
        1.0 - self.available.get(resource) as f64 / total as f64
    }

    /// Resource types with nonzero capacity, in ordinal order.
    pub fn resources(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.total.resources()
    }

    /// Take quantity out of the available supply.
    pub fn reserve(&mut self, resource: ResourceType, quantity: u64) -> Result<(), PoolError> {
        let available = self.available.get(resource);
        if quantity > available {
            return Err(PoolError::InsufficientAvailable {
                resource,
                requested: quantity,
                available,
            });
        }
        self.available.set(resource, available - quantity);
        Ok(())
    }

    /// Return quantity to the available supply.
    pub fn release(&mut self, resource: ResourceType, quantity: u64) -> Result<(), PoolError> {
        let available = self.available.get(resource);
        let total = self.total.get(resource);
        let restored = available + quantity;
        if restored > total {
            return Err(PoolError::ExceedsCapacity {
                resource,
                restored,
                total,
            });
        }
        self.available.set(resource, restored);
        Ok(())
    }

    /// Overwrite the available quantity directly. Used by the commit path
    /// when replacing one allocation set with another.
    pub fn set_available(&mut self, resource: ResourceType, quantity: u64) -> Result<(), PoolError> {
        let total = self.total.get(resource);
        if quantity > total {
            return Err(PoolError::ExceedsCapacity {
                resource,
                restored: quantity,
                total,
            });
        }
        self.available.set(resource, quantity);
        Ok(())
    }

    /// Read-only view of the current availability.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            total: self.total.clone(),
            available: self.available.clone(),
        }
    }

    /// Per-resource utilization report for observability callers.
    pub fn utilization_report(&self) -> Vec<UtilizationEntry> {
        self.total
            .resources()
            .map(|resource| UtilizationEntry {
                resource,
                total: self.total.get(resource),
                available: self.available.get(resource),
                utilization: self.utilization(resource),
            })
            .collect()
    }
}

/// Immutable availability view handed to arbitrators.
///
/// Arbitrators never mutate the pool; they compute against this snapshot
/// and only the transaction commit writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    total: ResourceBundle,
    available: ResourceBundle,
}

impl PoolSnapshot {
    pub fn total(&self, resource: ResourceType) -> u64 {
        self.total.get(resource)
    }

    pub fn available(&self, resource: ResourceType) -> u64 {
        self.available.get(resource)
    }

    pub fn utilization(&self, resource: ResourceType) -> f64 {
        let total = self.total.get(resource);
        if total == 0 {
            return 0.0;
        }
        1.0 - self.available.get(resource) as f64 / total as f64
    }

    /// Availability restricted to a subset of resources.
    pub fn restricted_to<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a ResourceType>,
    ) -> ResourceBundle {
        resources
            .into_iter()
            .map(|&r| (r, self.available.get(r)))
            .collect()
    }

    pub fn available_bundle(&self) -> &ResourceBundle {
        &self.available
    }
}

/// One row of the utilization report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationEntry {
    pub resource: ResourceType,
    pub total: u64,
    pub available: u64,
    pub utilization: f64,
}
