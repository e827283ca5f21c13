//! FairShare-Safety: Transaction Manager
//!
//! Begin / Prepare / Commit / Rollback framing every allocation mutation.
//! A transaction snapshots the mutable state of every participant at Begin;
//! Commit is all-or-nothing (the write set is validated before the first
//! write), and Rollback restores snapshots unconditionally and never fails.
//!
//! The log lines emitted here ([TXN-START], [TXN-PREPARED],
//! [TXN-PREPARE-FAILED], [TXN-COMMIT], [TXN-ROLLBACK]) are a contract;
//! downstream observability parses them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fairshare_core::{Agent, AgentSnapshot, ResourceBundle, ResourcePool, ResourceType};

use crate::monitor::{Proposal, SafetyMonitor, SafetyReport};

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Started,
    Prepared,
    Committed,
    RolledBack,
    Failed,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Started => "started",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// An in-flight transaction: snapshots plus a state machine.
///
/// Only the manager constructs these; the id is monotonically increasing
/// across the process.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u64,
    pub state: TransactionState,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    snapshots: BTreeMap<String, AgentSnapshot>,
}

impl Transaction {
    pub fn participant_ids(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    pub fn snapshot_of(&self, agent_id: &str) -> Option<&AgentSnapshot> {
        self.snapshots.get(agent_id)
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

/// Audit-log record for one finished transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub final_state: TransactionState,
    pub duration_ms: i64,
    pub agent_count: usize,
    pub resource_count: usize,
    pub outcome: String,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of [`TransactionManager::execute_transaction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub transaction_id: u64,
    pub state: TransactionState,
    pub committed: bool,
    pub message: String,
}

/// Transaction errors.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {id}: expected state {expected}, found {actual}")]
    InvalidState {
        id: u64,
        expected: &'static str,
        actual: TransactionState,
    },

    #[error("transaction {id} rejected by safety checks: {}", violations.join("; "))]
    SafetyRejected { id: u64, violations: Vec<String> },

    #[error("transaction {id}: unknown agent {agent_id}")]
    UnknownAgent { id: u64, agent_id: String },

    #[error("transaction {id}: commit failed: {reason}")]
    CommitFailed { id: u64, reason: String },
}

/// Begin / Prepare / Commit / Rollback over the shared agent registry.
pub struct TransactionManager {
    next_id: AtomicU64,
    monitor: SafetyMonitor,
    balance_floor: Decimal,
    audit: Mutex<Vec<TransactionRecord>>,
    log_lines: Mutex<Vec<String>>,
}

impl TransactionManager {
    pub fn new(monitor: SafetyMonitor) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            monitor,
            balance_floor: Decimal::ZERO,
            audit: Mutex::new(Vec::new()),
            log_lines: Mutex::new(Vec::new()),
        }
    }

    pub fn with_balance_floor(mut self, floor: Decimal) -> Self {
        self.balance_floor = floor;
        self
    }

    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    /// Snapshot the participants and open a transaction in Started state.
    pub fn begin(
        &self,
        agents: &BTreeMap<String, Agent>,
        participant_ids: &[String],
    ) -> Result<Transaction, TransactionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut snapshots = BTreeMap::new();
        for agent_id in participant_ids {
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| TransactionError::UnknownAgent {
                    id,
                    agent_id: agent_id.clone(),
                })?;
            snapshots.insert(agent_id.clone(), agent.snapshot());
        }

        self.log_line(format!("[TXN-START] {id} with {} agents", snapshots.len()));

        Ok(Transaction {
            id,
            state: TransactionState::Started,
            failure_reason: None,
            started_at: Utc::now(),
            snapshots,
        })
    }

    /// Run the pre-commit invariants (conservation, non-negativity, bounds)
    /// against the proposal. Moves to Prepared on success, Failed on
    /// violation.
    pub fn prepare(
        &self,
        txn: &mut Transaction,
        proposal: &Proposal,
        pool: &ResourcePool,
        agents: &BTreeMap<String, Agent>,
    ) -> Result<SafetyReport, TransactionError> {
        if txn.state != TransactionState::Started {
            return Err(TransactionError::InvalidState {
                id: txn.id,
                expected: "started",
                actual: txn.state,
            });
        }

        // What this proposal may consume: available supply plus whatever
        // the participants currently hold (their holdings are replaced,
        // not stacked).
        let mut capacities = ResourceBundle::new();
        for resource in ResourceType::ALL {
            let mut capacity = pool.available(resource);
            for snapshot in txn.snapshots.values() {
                capacity += snapshot.allocation.get(resource);
            }
            capacities.set(resource, capacity);
        }

        let balances: BTreeMap<String, Decimal> = txn
            .snapshots
            .keys()
            .filter_map(|id| agents.get(id).map(|a| (id.clone(), a.balance)))
            .collect();

        let report = SafetyReport {
            outcomes: vec![
                self.monitor.check_resource_conservation(proposal, &capacities),
                self.monitor.check_non_negativity(&balances, self.balance_floor),
                self.monitor.check_bound_compliance(proposal, agents),
            ],
        };

        if !report.passed() {
            let violations = report.violations();
            let reason = violations.join("; ");
            txn.state = TransactionState::Failed;
            txn.failure_reason = Some(reason.clone());
            self.log_line(format!("[TXN-PREPARE-FAILED] {} - {reason}", txn.id));
            self.finalize(txn, proposal, "prepare failed");
            return Err(TransactionError::SafetyRejected {
                id: txn.id,
                violations,
            });
        }

        txn.state = TransactionState::Prepared;
        self.log_line(format!("[TXN-PREPARED] {} - safety checks passed", txn.id));
        Ok(report)
    }

    /// Write the proposal into the agents and the pool. All-or-nothing:
    /// the write set is validated before the first write, and any
    /// validation failure rolls back and reports the reason.
    pub fn commit(
        &self,
        txn: &mut Transaction,
        proposal: &Proposal,
        agents: &mut BTreeMap<String, Agent>,
        pool: &mut ResourcePool,
    ) -> Result<usize, TransactionError> {
        if txn.state != TransactionState::Prepared {
            return Err(TransactionError::InvalidState {
                id: txn.id,
                expected: "prepared",
                actual: txn.state,
            });
        }

        // Pre-flight: every proposed agent must be a snapshotted
        // participant, and the pool delta must stay within [0, total].
        for agent_id in proposal.keys() {
            if !txn.snapshots.contains_key(agent_id) || !agents.contains_key(agent_id) {
                let reason = format!("agent {agent_id} not part of transaction");
                self.rollback(txn, agents);
                return Err(TransactionError::CommitFailed { id: txn.id, reason });
            }
        }

        let mut new_available: BTreeMap<ResourceType, i128> = BTreeMap::new();
        for resource in ResourceType::ALL {
            let mut available = pool.available(resource) as i128;
            for (agent_id, bundle) in proposal {
                let old = txn.snapshots[agent_id].allocation.get(resource) as i128;
                let new = bundle.get(resource) as i128;
                available += old - new;
            }
            if available < 0 || available > pool.total(resource) as i128 {
                let reason = format!("pool delta for {resource} out of range ({available})");
                self.rollback(txn, agents);
                return Err(TransactionError::CommitFailed { id: txn.id, reason });
            }
            new_available.insert(resource, available);
        }

        // Apply. Nothing below can fail.
        for (agent_id, bundle) in proposal {
            let agent = agents.get_mut(agent_id).expect("pre-flight checked");
            agent.allocation = bundle.clone();
        }
        for (resource, available) in new_available {
            pool.set_available(resource, available as u64)
                .expect("pre-flight checked");
        }

        txn.state = TransactionState::Committed;
        let writes = proposal.len();
        self.log_line(format!(
            "[TXN-COMMIT] {} - {writes} allocations applied",
            txn.id
        ));
        self.finalize(txn, proposal, "committed");
        Ok(writes)
    }

    /// Restore every participant's snapshot unconditionally. Never fails;
    /// a committed transaction is not undone (start a new one instead).
    pub fn rollback(&self, txn: &mut Transaction, agents: &mut BTreeMap<String, Agent>) {
        if txn.is_terminal() {
            return;
        }

        for (agent_id, snapshot) in &txn.snapshots {
            if let Some(agent) = agents.get_mut(agent_id) {
                agent.restore(snapshot);
            }
        }

        self.log_line(format!(
            "[TXN-ROLLBACK] {} - restoring previous state",
            txn.id
        ));
        txn.state = TransactionState::RolledBack;
        self.finalize(txn, &Proposal::new(), "rolled back");
    }

    /// The canonical high-level entry point: begin, prepare, commit, with
    /// rollback on any failure. Never panics; the outcome reports what
    /// happened.
    pub fn execute_transaction(
        &self,
        participant_ids: &[String],
        proposal: &Proposal,
        agents: &mut BTreeMap<String, Agent>,
        pool: &mut ResourcePool,
    ) -> TransactionOutcome {
        let mut txn = match self.begin(agents, participant_ids) {
            Ok(txn) => txn,
            Err(err) => {
                return TransactionOutcome {
                    transaction_id: 0,
                    state: TransactionState::Failed,
                    committed: false,
                    message: err.to_string(),
                }
            }
        };

        if let Err(err) = self.prepare(&mut txn, proposal, pool, agents) {
            return TransactionOutcome {
                transaction_id: txn.id,
                state: txn.state,
                committed: false,
                message: err.to_string(),
            };
        }

        match self.commit(&mut txn, proposal, agents, pool) {
            Ok(writes) => TransactionOutcome {
                transaction_id: txn.id,
                state: txn.state,
                committed: true,
                message: format!("{writes} allocations applied"),
            },
            Err(err) => TransactionOutcome {
                transaction_id: txn.id,
                state: txn.state,
                committed: false,
                message: err.to_string(),
            },
        }
    }

    /// All audit records, oldest first.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.audit.lock().clone()
    }

    /// Audit records with a given final state.
    pub fn by_state(&self, state: TransactionState) -> Vec<TransactionRecord> {
        self.audit
            .lock()
            .iter()
            .filter(|r| r.final_state == state)
            .cloned()
            .collect()
    }

    /// The most recent `n` audit records, newest first.
    pub fn recent(&self, n: usize) -> Vec<TransactionRecord> {
        self.audit.lock().iter().rev().take(n).cloned().collect()
    }

    /// The transaction log lines, oldest first.
    pub fn transaction_log(&self) -> Vec<String> {
        self.log_lines.lock().clone()
    }

    fn log_line(&self, line: String) {
        tracing::info!("{line}");
        self.log_lines.lock().push(line);
    }

    fn finalize(&self, txn: &mut Transaction, proposal: &Proposal, outcome: &str) {
        if !txn.is_terminal() {
            return;
        }
        let completed_at = Utc::now();
        let resource_count = proposal
            .values()
            .flat_map(|b| b.resources())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        self.audit.lock().push(TransactionRecord {
            id: txn.id,
            final_state: txn.state,
            duration_ms: (completed_at - txn.started_at).num_milliseconds(),
            agent_count: txn.snapshots.len(),
            resource_count,
            outcome: outcome.to_string(),
            completed_at,
        });
        // Snapshots are only needed until the terminal state.
        txn.snapshots.clear();
    }
}
