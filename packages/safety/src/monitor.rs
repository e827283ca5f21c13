//! FairShare-Safety: Safety Monitor
//!
//! Centralized invariant checks framing every state mutation. Each check is
//! stateless; outcomes are appended to an append-only safety log so
//! concurrent readers see a monotonically growing history.
//!
//! In strict mode a violation is raised as an error and aborts the commit;
//! in lenient mode violations are recorded and returned in the report.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fairshare_core::{Agent, ResourceBundle, ResourceType};

/// Allocation proposal under check: integer bundle per agent id.
pub type Proposal = BTreeMap<String, ResourceBundle>;

/// Violation tolerance for currency conservation.
const CURRENCY_TOLERANCE: Decimal = dec!(0.01);

/// How the monitor reacts to violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Violations raise an error and abort the commit
    Strict,
    /// Violations are recorded and returned
    Lenient,
}

/// The five invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ResourceConservation,
    NonNegativity,
    BoundCompliance,
    CurrencyConservation,
    IndividualRationality,
}

impl CheckKind {
    fn name(self) -> &'static str {
        match self {
            CheckKind::ResourceConservation => "resource_conservation",
            CheckKind::NonNegativity => "non_negativity",
            CheckKind::BoundCompliance => "bound_compliance",
            CheckKind::CurrencyConservation => "currency_conservation",
            CheckKind::IndividualRationality => "individual_rationality",
        }
    }
}

/// Outcome of one invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: CheckKind,
    pub passed: bool,
    /// Human-readable violation descriptions, empty when passed
    pub violations: Vec<String>,
}

/// Aggregated outcome of a verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl SafetyReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    /// All violation strings across checks.
    pub fn violations(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .flat_map(|o| o.violations.iter().cloned())
            .collect()
    }
}

/// One entry of the append-only safety log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLogEntry {
    pub timestamp: DateTime<Utc>,
    pub check: CheckKind,
    pub passed: bool,
    pub violations: Vec<String>,
}

/// A safety violation raised in strict mode.
#[derive(Debug, thiserror::Error)]
#[error("safety violation: {}", violations.join("; "))]
pub struct SafetyViolation {
    pub violations: Vec<String>,
}

/// Centralized invariant checker.
pub struct SafetyMonitor {
    mode: SafetyMode,
    log: Mutex<Vec<SafetyLogEntry>>,
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new(SafetyMode::Strict)
    }
}

impl SafetyMonitor {
    pub fn new(mode: SafetyMode) -> Self {
        Self {
            mode,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> SafetyMode {
        self.mode
    }

    /// Invariant 1: per resource, allocated total must not exceed capacity.
    pub fn check_resource_conservation(
        &self,
        proposal: &Proposal,
        capacities: &ResourceBundle,
    ) -> CheckOutcome {
        let mut totals = ResourceBundle::new();
        for bundle in proposal.values() {
            totals.merge(bundle);
        }

        let mut violations = Vec::new();
        for resource in ResourceType::ALL {
            let allocated = totals.get(resource);
            let capacity = capacities.get(resource);
            if allocated > capacity {
                violations.push(format!(
                    "{resource}: allocated {allocated} exceeds capacity {capacity}"
                ));
            }
        }
        self.record(CheckKind::ResourceConservation, violations)
    }

    /// Invariant 2: allocations are nonnegative (structural for integer
    /// bundles) and balances sit at or above the floor.
    pub fn check_non_negativity(
        &self,
        balances: &BTreeMap<String, Decimal>,
        floor: Decimal,
    ) -> CheckOutcome {
        let mut violations = Vec::new();
        for (agent_id, balance) in balances {
            if *balance < floor {
                violations.push(format!(
                    "agent {agent_id}: balance {balance} below floor {floor}"
                ));
            }
        }
        self.record(CheckKind::NonNegativity, violations)
    }

    /// Invariant 3: min <= allocation <= ideal per agent and resource.
    pub fn check_bound_compliance(
        &self,
        proposal: &Proposal,
        agents: &BTreeMap<String, Agent>,
    ) -> CheckOutcome {
        let mut violations = Vec::new();
        for (agent_id, bundle) in proposal {
            let Some(agent) = agents.get(agent_id) else {
                violations.push(format!("agent {agent_id}: unknown agent in proposal"));
                continue;
            };
            for resource in ResourceType::ALL {
                let allocated = bundle.get(resource);
                let minimum = agent.minimum(resource);
                let ideal = agent.ideal(resource);
                if allocated < minimum || allocated > ideal {
                    violations.push(format!(
                        "agent {agent_id}: {resource} allocation {allocated} outside [{minimum}, {ideal}]"
                    ));
                }
            }
        }
        self.record(CheckKind::BoundCompliance, violations)
    }

    /// Invariant 4: sum of balances equals initial + minted - burned,
    /// within a 0.01 tolerance.
    pub fn check_currency_conservation(
        &self,
        balances: &BTreeMap<String, Decimal>,
        expected_total: Decimal,
    ) -> CheckOutcome {
        let actual: Decimal = balances.values().copied().sum();
        let drift = (actual - expected_total).abs();

        let mut violations = Vec::new();
        if drift > CURRENCY_TOLERANCE {
            violations.push(format!(
                "currency drift {drift}: balances sum to {actual}, expected {expected_total}"
            ));
        }
        self.record(CheckKind::CurrencyConservation, violations)
    }

    /// Invariant 5: every allocation covers the agent's minimum (the
    /// outside option). Redundant with bound compliance when bounds hold,
    /// but checked independently.
    pub fn check_individual_rationality(
        &self,
        proposal: &Proposal,
        agents: &BTreeMap<String, Agent>,
    ) -> CheckOutcome {
        let mut violations = Vec::new();
        for (agent_id, bundle) in proposal {
            let Some(agent) = agents.get(agent_id) else {
                continue;
            };
            for resource in ResourceType::ALL {
                let allocated = bundle.get(resource);
                let minimum = agent.minimum(resource);
                if allocated < minimum {
                    violations.push(format!(
                        "agent {agent_id}: {resource} allocation {allocated} below outside option {minimum}"
                    ));
                }
            }
        }
        self.record(CheckKind::IndividualRationality, violations)
    }

    /// The pre-commit verification set (invariants 1-3) used by Prepare.
    ///
    /// `capacities` is what this proposal may consume: the available supply
    /// plus whatever the participating agents currently hold.
    pub fn verify_proposal(
        &self,
        proposal: &Proposal,
        capacities: &ResourceBundle,
        agents: &BTreeMap<String, Agent>,
        balances: &BTreeMap<String, Decimal>,
        floor: Decimal,
    ) -> Result<SafetyReport, SafetyViolation> {
        let report = SafetyReport {
            outcomes: vec![
                self.check_resource_conservation(proposal, capacities),
                self.check_non_negativity(balances, floor),
                self.check_bound_compliance(proposal, agents),
            ],
        };
        self.finish(report)
    }

    /// All five invariants, for post-commit audits.
    pub fn verify_full(
        &self,
        proposal: &Proposal,
        capacities: &ResourceBundle,
        agents: &BTreeMap<String, Agent>,
        balances: &BTreeMap<String, Decimal>,
        floor: Decimal,
        expected_currency_total: Decimal,
    ) -> Result<SafetyReport, SafetyViolation> {
        let report = SafetyReport {
            outcomes: vec![
                self.check_resource_conservation(proposal, capacities),
                self.check_non_negativity(balances, floor),
                self.check_bound_compliance(proposal, agents),
                self.check_currency_conservation(balances, expected_currency_total),
                self.check_individual_rationality(proposal, agents),
            ],
        };
        self.finish(report)
    }

    /// Append-only log of every check performed.
    pub fn log(&self) -> Vec<SafetyLogEntry> {
        self.log.lock().clone()
    }

    fn finish(&self, report: SafetyReport) -> Result<SafetyReport, SafetyViolation> {
        if !report.passed() && self.mode == SafetyMode::Strict {
            return Err(SafetyViolation {
                violations: report.violations(),
            });
        }
        Ok(report)
    }

    fn record(&self, check: CheckKind, violations: Vec<String>) -> CheckOutcome {
        let passed = violations.is_empty();
        if !passed {
            tracing::warn!(check = check.name(), ?violations, "safety check failed");
        }
        self.log.lock().push(SafetyLogEntry {
            timestamp: Utc::now(),
            check,
            passed,
            violations: violations.clone(),
        });
        CheckOutcome {
            check,
            passed,
            violations,
        }
    }
}
