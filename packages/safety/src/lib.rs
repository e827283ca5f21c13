//! FairShare-Safety: Invariant Checks & Atomic Commit
//!
//! Everything that stands between a solver's proposal and the shared
//! state:
//!
//! - **Safety monitor**: the five invariants (resource conservation,
//!   non-negativity, bound compliance, currency conservation, individual
//!   rationality), strict or lenient, with an append-only safety log
//! - **Transaction manager**: Begin / Prepare / Commit / Rollback with
//!   full snapshots, a monotonic id sequence, contract log lines, and an
//!   in-memory audit ledger

pub mod monitor;
pub mod transaction;

// Re-exports
pub use monitor::{
    CheckKind, CheckOutcome, Proposal, SafetyLogEntry, SafetyMode, SafetyMonitor, SafetyReport,
    SafetyViolation,
};
pub use transaction::{
    Transaction, TransactionError, TransactionManager, TransactionOutcome, TransactionRecord,
    TransactionState,
};
