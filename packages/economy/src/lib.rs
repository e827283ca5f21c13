//! FairShare-Economy: Priority Currency & Demand Multipliers
//!
//! The economic layer feeding the arbitrators:
//!
//! - **Priority weights**: `base_weight + burn`, additive so every agent
//!   keeps a minimum weight no matter what others spend
//! - **Demand multipliers**: per-resource scarcity signal, EMA-smoothed to
//!   damp the allocate/release feedback oscillation
//! - **Release earnings**: currency minted for handing supply back early,
//!   scaled by the smoothed multiplier
//! - **Currency ledger**: single source of truth for the conservation
//!   invariant (sum of balances == initial + minted - burned)

pub mod economy;
pub mod multiplier;

// Re-exports
pub use economy::{CurrencyLedger, EconomyConfig, EconomyError, PriorityEconomy};
pub use multiplier::{DemandMultipliers, MultiplierState};
