//! FairShare-Economy: Priority Economy
//!
//! Burned currency raises an agent's arbitration weight for one cycle;
//! releasing resources back to the pool earns currency scaled by the
//! smoothed demand multiplier. All minting and burning flows through here
//! so the currency-conservation invariant can be checked from one ledger.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use fairshare_core::{PoolSnapshot, ResourceType};

use crate::multiplier::DemandMultipliers;

/// Named economy constants. Unknown keys are rejected at the config layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EconomyConfig {
    /// EMA smoothing factor
    pub alpha: f64,
    /// Additive base of every agent's priority weight
    pub base_weight: f64,
    /// Lower multiplier bound
    pub multiplier_min: f64,
    /// Upper multiplier bound
    pub multiplier_max: f64,
    /// Currency floor per agent (zero unless explicit debt is enabled)
    pub balance_floor: Decimal,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            alpha: 0.15,
            base_weight: 10.0,
            multiplier_min: 1.0,
            multiplier_max: 5.0,
            balance_floor: Decimal::ZERO,
        }
    }
}

impl EconomyConfig {
    pub fn validate(&self) -> Result<(), EconomyError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(EconomyError::InvalidConfig { field: "alpha" });
        }
        if self.base_weight <= 0.0 {
            return Err(EconomyError::InvalidConfig {
                field: "base_weight",
            });
        }
        if self.multiplier_min < 1.0 || self.multiplier_min > self.multiplier_max {
            return Err(EconomyError::InvalidConfig {
                field: "multiplier_min/multiplier_max",
            });
        }
        Ok(())
    }
}

/// Running totals for the currency-conservation invariant:
/// sum of balances == initial + minted - burned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrencyLedger {
    /// Currency present at registration time
    pub initial: Decimal,
    /// Earned through releases
    pub minted: Decimal,
    /// Burned for priority (spent, not transferred)
    pub burned: Decimal,
}

impl CurrencyLedger {
    /// Expected sum of all balances right now.
    pub fn expected_total(&self) -> Decimal {
        self.initial + self.minted - self.burned
    }
}

/// The priority economy: multipliers, weights, and earnings.
#[derive(Debug)]
pub struct PriorityEconomy {
    config: EconomyConfig,
    multipliers: DemandMultipliers,
    ledger: CurrencyLedger,
}

impl Default for PriorityEconomy {
    fn default() -> Self {
        Self::new(EconomyConfig::default())
    }
}

impl PriorityEconomy {
    pub fn new(config: EconomyConfig) -> Self {
        Self {
            multipliers: DemandMultipliers::new(&config),
            config,
            ledger: CurrencyLedger::default(),
        }
    }

    pub fn config(&self) -> &EconomyConfig {
        &self.config
    }

    pub fn ledger(&self) -> &CurrencyLedger {
        &self.ledger
    }

    /// Register currency that exists before any minting or burning.
    pub fn register_initial_balance(&mut self, balance: Decimal) {
        self.ledger.initial += balance;
    }

    /// Arbitration weight for a burn amount: BaseWeight + burn.
    ///
    /// The additive form guarantees every agent a minimum weight, which is
    /// what keeps a coalition of burners from starving a zero-burn agent.
    pub fn priority_weight(&self, burn: Decimal) -> f64 {
        self.config.base_weight + burn.to_f64().unwrap_or(0.0).max(0.0)
    }

    /// Observe the pool and return the smoothed multiplier for a resource.
    pub fn multiplier_for(&mut self, resource: ResourceType, pool: &PoolSnapshot) -> f64 {
        self.multipliers.multiplier_for(resource, pool)
    }

    /// Latest raw multiplier, exposed for observability only.
    pub fn raw_multiplier(&self, resource: ResourceType) -> f64 {
        self.multipliers.raw_multiplier(resource)
    }

    /// Latest smoothed multiplier without observing the pool.
    pub fn smoothed_multiplier(&self, resource: ResourceType) -> f64 {
        self.multipliers.smoothed_multiplier(resource)
    }

    /// Utilization history for one resource.
    pub fn utilization_history(&self, resource: ResourceType) -> &[f64] {
        self.multipliers.history(resource)
    }

    /// Earnings for releasing `quantity` of a resource with
    /// `time_remaining_fraction` of its lease left: qty * frac * smoothed,
    /// banker's-rounded to two decimal places.
    pub fn release_earnings(
        &mut self,
        resource: ResourceType,
        quantity: u64,
        time_remaining_fraction: f64,
        pool: &PoolSnapshot,
    ) -> Decimal {
        let multiplier = self.multiplier_for(resource, pool);
        let frac = time_remaining_fraction.clamp(0.0, 1.0);
        let earnings = quantity as f64 * frac * multiplier;
        Decimal::from_f64_retain(earnings)
            .unwrap_or(Decimal::ZERO)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
    }

    /// Mint earnings into an agent balance. Returns the new balance.
    pub fn credit_release(&mut self, balance: Decimal, earnings: Decimal) -> Decimal {
        self.ledger.minted += earnings;
        balance + earnings
    }

    /// Burn currency from an agent balance. Fails below the configured
    /// floor; burns are spent, never transferred.
    pub fn burn(&mut self, balance: Decimal, amount: Decimal) -> Result<Decimal, EconomyError> {
        if amount < Decimal::ZERO {
            return Err(EconomyError::NegativeBurn { amount });
        }
        let remaining = balance - amount;
        if remaining < self.config.balance_floor {
            return Err(EconomyError::InsufficientBalance {
                balance,
                requested: amount,
                floor: self.config.balance_floor,
            });
        }
        self.ledger.burned += amount;
        tracing::debug!(%amount, %remaining, "currency burned for priority");
        Ok(remaining)
    }
}

/// Economy errors.
#[derive(Debug, thiserror::Error)]
pub enum EconomyError {
    #[error("invalid economy config: {field}")]
    InvalidConfig { field: &'static str },

    #[error("cannot burn negative amount {amount}")]
    NegativeBurn { amount: Decimal },

    #[error("balance {balance} cannot cover burn {requested} (floor {floor})")]
    InsufficientBalance {
        balance: Decimal,
        requested: Decimal,
        floor: Decimal,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairshare_core::{ResourceBundle, ResourcePool};
    use rust_decimal_macros::dec;

    fn half_used_snapshot() -> PoolSnapshot {
        let mut pool = ResourcePool::new(ResourceBundle::new().with(ResourceType::Compute, 100));
        pool.reserve(ResourceType::Compute, 50).unwrap();
        pool.snapshot()
    }

    #[test]
    fn test_priority_weight_is_additive() {
        let economy = PriorityEconomy::default();
        assert!((economy.priority_weight(Decimal::ZERO) - 10.0).abs() < 1e-9);
        assert!((economy.priority_weight(dec!(50)) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_release_earnings_formula() {
        let mut economy = PriorityEconomy::default();
        // First observation: smoothed == raw == 1 + 4*0.5 = 3.0
        let earnings =
            economy.release_earnings(ResourceType::Compute, 10, 0.5, &half_used_snapshot());
        assert_eq!(earnings, dec!(15.00));
    }

    #[test]
    fn test_release_earnings_bankers_rounding() {
        let mut economy = PriorityEconomy::default();
        // qty=1, frac=0.2375 -> 1 * 0.2375 * 3.0 = 0.7125 -> rounds to even: 0.71
        let earnings =
            economy.release_earnings(ResourceType::Compute, 1, 0.2375, &half_used_snapshot());
        assert_eq!(earnings, dec!(0.71));
    }

    #[test]
    fn test_burn_respects_floor() {
        let mut economy = PriorityEconomy::default();
        let balance = dec!(30);

        let remaining = economy.burn(balance, dec!(30)).unwrap();
        assert_eq!(remaining, Decimal::ZERO);

        let err = economy.burn(dec!(10), dec!(11)).unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_ledger_tracks_mint_and_burn() {
        let mut economy = PriorityEconomy::default();
        economy.register_initial_balance(dec!(100));

        let balance = economy.credit_release(dec!(100), dec!(12.50));
        assert_eq!(balance, dec!(112.50));

        let balance = economy.burn(balance, dec!(12.50)).unwrap();
        assert_eq!(balance, dec!(100));

        let ledger = economy.ledger();
        assert_eq!(ledger.initial, dec!(100));
        assert_eq!(ledger.minted, dec!(12.50));
        assert_eq!(ledger.burned, dec!(12.50));
        assert_eq!(ledger.expected_total(), dec!(100));
    }

    #[test]
    fn test_config_validation() {
        let mut config = EconomyConfig::default();
        assert!(config.validate().is_ok());

        config.alpha = 0.0;
        assert!(config.validate().is_err());

        config = EconomyConfig {
            multiplier_min: 0.5,
            ..EconomyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
