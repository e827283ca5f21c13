//! FairShare-Arbiter: Multi-Agent Resource Arbitration Engine
//!
//! The decision kernel of the scheduler: given agents with min/ideal
//! demands, preference weights, and burned priority currency, compute an
//! integer allocation maximizing weighted-log social welfare under
//! capacity, box, and conservation constraints.
//!
//! # Pipeline
//!
//! ```text
//! Requests -> Embargo batching -> Contention detection -> Group splitting
//!   -> Per-group arbitration -> Safety check -> Atomic commit
//!   -> Earnings & multiplier update
//! ```
//!
//! Features:
//! - **Embargo queue**: deterministic hash-ordered batching across
//!   submission jitter
//! - **Contention detection**: union-find components over the contention
//!   graph
//! - **Grouping policy**: pairwise k-hop limit, compatibility matrix, size
//!   cap with five split strategies, shared-supply partitioning
//! - **Water-filling**: exact proportional fairness on one resource
//! - **Gradient solver**: in-process projected gradient ascent for joint
//!   problems
//! - **Convex solver**: out-of-process exact path over JSON, with
//!   transparent gradient fallback
//! - **Service shim**: service slots translated to resource demands

pub mod config;
pub mod convex;
pub mod detector;
pub mod embargo;
pub mod gradient;
pub mod grouping;
pub mod rounding;
pub mod scheduler;
pub mod service;
pub mod solver;
pub mod waterfill;

// Re-exports
pub use config::{AgentSpec, ConfigError, Mechanism, ScenarioSpec};
pub use convex::{
    ConvexJointArbitrator, ConvexProblem, ConvexSolution, ConvexSolverConfig, SolverError,
};
pub use detector::{ContentionAnalysis, ContentionDetector, ContentionGraph, UnionFind};
pub use embargo::{ArbitrationRequest, EmbargoQueue, RequestBatch};
pub use gradient::{GradientConfig, GradientJointArbitrator};
pub use grouping::{
    CompatibilityMatrix, GroupSplitter, GroupingPolicy, PolicyError, SplitStrategy,
};
pub use scheduler::{ArbitrationScheduler, CycleReport, SchedulerError};
pub use service::{
    MockServiceBackend, ServiceArbitrator, ServiceBackend, ServiceCatalog, ServiceError,
    ServiceResponse, ServiceSlotRequest,
};
pub use solver::{AgentDemand, JointArbitrator, JointProblem};
pub use waterfill::{SingleResourceRequest, WaterFillingArbitrator};
