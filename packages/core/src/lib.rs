//! FairShare-Core: Data Model for the Resource Arbitration Kernel
//!
//! Entities shared by every stage of the arbitration pipeline:
//!
//! - **Resources**: the closed, ordinal-ordered [`ResourceType`] set and
//!   integer [`ResourceBundle`]s
//! - **Pool**: process-wide capacity/availability with read-only snapshots
//! - **Agents**: demands, utility, allocation, currency balance
//! - **Utilities**: the closed sum type of concave/quasi-concave valuations
//! - **Contention**: single- and multi-resource coupling views
//! - **Results**: allocation value objects handed back to the scheduler

pub mod agent;
pub mod contention;
pub mod error;
pub mod pool;
pub mod resource;
pub mod result;
pub mod utility;

// Re-exports
pub use agent::{Agent, AgentSnapshot};
pub use contention::{Contention, ContentionGroup};
pub use error::{AgentError, PoolError};
pub use pool::{PoolSnapshot, ResourcePool, UtilizationEntry};
pub use resource::{ResourceBundle, ResourceType};
pub use result::{AllocationResult, JointAllocationResult};
pub use utility::{CesNest, Point, UtilityError, UtilityFunction, Weights};

/// Near-zero guard used across the solvers: denominators below this are
/// replaced by it rather than surfacing an arithmetic error.
pub const EPSILON: f64 = 1e-9;
