//! FairShare-Arbiter: Arbitration Scheduler
//!
//! The cycle driver tying the pipeline together: embargo drain, contention
//! detection, policy splitting, per-group arbitration, safety-checked
//! transaction, then the economy tick. One cycle runs without internal
//! suspension points except the out-of-process solver call.
//!
//! The scheduler owns the pool, the agent registry, the economy, and the
//! transaction manager for the process lifetime. Arbitrators only ever see
//! read-only snapshots; the transaction commit is the single writer.

use std::collections::BTreeMap;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fairshare_core::{
    Agent, AgentError, ContentionGroup, JointAllocationResult, PoolError, ResourceBundle,
    ResourcePool, ResourceType, EPSILON,
};
use fairshare_economy::PriorityEconomy;
use fairshare_safety::{
    Proposal, SafetyMode, SafetyMonitor, SafetyReport, SafetyViolation, TransactionManager,
    TransactionOutcome,
};

use crate::config::{ConfigError, Mechanism, ScenarioSpec};
use crate::convex::ConvexJointArbitrator;
use crate::detector::ContentionDetector;
use crate::embargo::{ArbitrationRequest, EmbargoQueue, RequestBatch};
use crate::gradient::GradientJointArbitrator;
use crate::grouping::GroupSplitter;
use crate::solver::{AgentDemand, JointArbitrator, JointProblem};
use crate::waterfill::{SingleResourceRequest, WaterFillingArbitrator};

/// What one arbitration cycle did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub batch_size: usize,
    pub group_count: usize,
    /// Allocations proposed (and, when `outcome` committed, applied)
    pub allocations: Proposal,
    /// Weighted-log social welfare of the proposal
    pub welfare: f64,
    /// Transaction outcome; absent when the batch produced no proposal
    pub outcome: Option<TransactionOutcome>,
    pub messages: Vec<String>,
}

impl CycleReport {
    fn empty(messages: Vec<String>) -> Self {
        Self {
            batch_size: 0,
            group_count: 0,
            allocations: Proposal::new(),
            welfare: 0.0,
            outcome: None,
            messages,
        }
    }

    pub fn committed(&self) -> bool {
        self.outcome.as_ref().map(|o| o.committed).unwrap_or(false)
    }
}

/// Scheduler errors surfaced outside a cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("agent {agent_id} does not hold {quantity} of {resource}")]
    NothingToRelease {
        agent_id: String,
        resource: ResourceType,
        quantity: u64,
    },
}

/// The arbitration cycle driver.
pub struct ArbitrationScheduler {
    pool: ResourcePool,
    agents: BTreeMap<String, Agent>,
    economy: PriorityEconomy,
    transactions: TransactionManager,
    queue: EmbargoQueue,
    detector: ContentionDetector,
    splitter: GroupSplitter,
    waterfill: WaterFillingArbitrator,
    joint: Box<dyn JointArbitrator>,
    mechanism: Mechanism,
}

impl ArbitrationScheduler {
    /// Build the full pipeline from a scenario.
    pub fn from_spec(spec: &ScenarioSpec) -> Result<Self, SchedulerError> {
        spec.validate()?;
        let pool = spec.build_pool();
        let agents = spec.build_agents()?;

        let mut economy = PriorityEconomy::new(spec.economy.clone());
        for agent in agents.values() {
            economy.register_initial_balance(agent.balance);
        }

        let joint: Box<dyn JointArbitrator> = match (spec.mechanism, &spec.convex_solver) {
            (Mechanism::ConvexJoint, Some(solver)) => {
                Box::new(ConvexJointArbitrator::new(solver.clone()))
            }
            _ => Box::new(GradientJointArbitrator::new()),
        };

        let floor = spec.economy.balance_floor;
        Ok(Self {
            pool,
            agents,
            economy,
            transactions: TransactionManager::new(SafetyMonitor::new(SafetyMode::Strict))
                .with_balance_floor(floor),
            queue: EmbargoQueue::default(),
            detector: ContentionDetector::new(),
            splitter: GroupSplitter::new(spec.policy.clone().unwrap_or_default()),
            waterfill: WaterFillingArbitrator::new(),
            joint,
            mechanism: spec.mechanism,
        })
    }

    pub fn with_queue(mut self, queue: EmbargoQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Enqueue a request for the next cycle. Callable from any thread.
    pub fn submit(&self, request: ArbitrationRequest) {
        self.queue.submit(request);
    }

    /// Drain matured requests and arbitrate them. Returns an empty report
    /// when nothing has matured.
    pub async fn run_cycle(&mut self) -> CycleReport {
        match self.queue.try_drain() {
            Some(batch) => self.arbitrate_batch(batch).await,
            None => CycleReport::empty(Vec::new()),
        }
    }

    /// Force a batch out of the embargo queue and arbitrate it.
    pub async fn flush_and_run(&mut self) -> CycleReport {
        match self.queue.flush_all() {
            Some(batch) => self.arbitrate_batch(batch).await,
            None => CycleReport::empty(Vec::new()),
        }
    }

    /// Wait for the embargo window, then arbitrate. Blocks at most the
    /// embargo window.
    pub async fn wait_and_run(&mut self) -> CycleReport {
        match self.queue.wait_and_collect().await {
            Some(batch) => self.arbitrate_batch(batch).await,
            None => CycleReport::empty(Vec::new()),
        }
    }

    async fn arbitrate_batch(&mut self, batch: RequestBatch) -> CycleReport {
        let batch_size = batch.len();
        let mut messages = Vec::new();

        // Settle burns and fix the cycle weights, in batch order.
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        let mut participant_ids: Vec<String> = Vec::new();
        for request in &batch.requests {
            if weights.contains_key(&request.agent_id) {
                continue;
            }
            let Some(agent) = self.agents.get_mut(&request.agent_id) else {
                messages.push(format!("unknown agent {} skipped", request.agent_id));
                continue;
            };

            let mut burn = request.burn.max(Decimal::ZERO);
            if burn > Decimal::ZERO {
                match self.economy.burn(agent.balance, burn) {
                    Ok(balance) => agent.balance = balance,
                    Err(err) => {
                        messages.push(format!("agent {}: burn rejected ({err})", agent.id));
                        burn = Decimal::ZERO;
                    }
                }
            }
            agent.burn = burn;
            weights.insert(agent.id.clone(), self.economy.priority_weight(burn));
            participant_ids.push(agent.id.clone());
        }

        if participant_ids.is_empty() {
            return CycleReport::empty(messages);
        }

        // Participants re-arbitrate from scratch: their current holdings
        // count as available for this cycle's solve.
        let mut effective = self.pool.clone();
        for id in &participant_ids {
            let holdings = self.agents[id].allocation.clone();
            for (resource, quantity) in holdings.iter() {
                if let Err(err) = effective.release(resource, quantity) {
                    tracing::error!(agent = %id, %err, "holdings exceed pool capacity");
                }
            }
        }
        let snapshot = effective.snapshot();

        let analysis = {
            let participating: Vec<&Agent> = participant_ids
                .iter()
                .filter_map(|id| self.agents.get(id))
                .collect();
            self.detector.detect(&participating, &snapshot)
        };
        let groups = self
            .splitter
            .split(&analysis.groups, &analysis.graph, &self.agents, &snapshot);

        let mut proposal = Proposal::new();
        let mut remaining = snapshot.available_bundle().clone();

        for group in &groups {
            let result = self.arbitrate_group(group, &weights).await;
            messages.push(format!("group {}: {}", group.id, result.message));
            if let Some(note) = &group.note {
                messages.push(format!("group {}: {note}", group.id));
            }
            if !result.feasible {
                continue;
            }
            for (agent_id, bundle) in result.allocations {
                for (resource, quantity) in bundle.iter() {
                    remaining.saturating_sub(resource, quantity);
                }
                proposal.insert(agent_id, bundle);
            }
        }

        // Uncontended agents take min(ideal, what's left), in batch order.
        for agent_id in &analysis.singletons {
            let agent = &self.agents[agent_id];
            let mut bundle = ResourceBundle::new();
            let mut feasible = true;
            for (resource, ideal) in agent.ideals.iter() {
                let granted = ideal.min(remaining.get(resource));
                if granted < agent.minimum(resource) {
                    feasible = false;
                    break;
                }
                bundle.set(resource, granted);
            }
            if !feasible {
                messages.push(format!(
                    "agent {agent_id}: minimums unsatisfiable, keeping previous allocation"
                ));
                continue;
            }
            for (resource, quantity) in bundle.iter() {
                remaining.saturating_sub(resource, quantity);
            }
            proposal.insert(agent_id.clone(), bundle);
        }

        let outcome = if proposal.is_empty() {
            None
        } else {
            let ids: Vec<String> = proposal.keys().cloned().collect();
            Some(self.transactions.execute_transaction(
                &ids,
                &proposal,
                &mut self.agents,
                &mut self.pool,
            ))
        };

        // Economy tick: multipliers observe the post-commit pool.
        let post_commit = self.pool.snapshot();
        let resources: Vec<ResourceType> = self.pool.resources().collect();
        for resource in resources {
            self.economy.multiplier_for(resource, &post_commit);
        }

        let welfare = self.proposal_welfare(&proposal);
        CycleReport {
            batch_size,
            group_count: groups.len(),
            allocations: proposal,
            welfare,
            outcome,
            messages,
        }
    }

    async fn arbitrate_group(
        &self,
        group: &ContentionGroup,
        weights: &BTreeMap<String, f64>,
    ) -> JointAllocationResult {
        let members: Vec<&Agent> = group
            .agent_ids
            .iter()
            .filter_map(|id| self.agents.get(id))
            .collect();

        // One contested axis solves exactly regardless of mechanism.
        if let Some(resource) = group.single_resource() {
            return self.waterfill_group(group, resource, &members, weights);
        }

        match self.mechanism {
            Mechanism::ProportionalFairness => {
                self.sequential_waterfill(group, &members, weights)
            }
            Mechanism::GradientJoint | Mechanism::ConvexJoint => {
                let demands: Vec<AgentDemand> = members
                    .iter()
                    .map(|agent| {
                        AgentDemand::from_agent(agent, self.weight_of(weights, &agent.id))
                    })
                    .collect();
                let problem = JointProblem::from_group(group, demands);
                self.joint.solve(&problem).await
            }
        }
    }

    fn waterfill_group(
        &self,
        group: &ContentionGroup,
        resource: ResourceType,
        members: &[&Agent],
        weights: &BTreeMap<String, f64>,
    ) -> JointAllocationResult {
        let requests: Vec<SingleResourceRequest> = members
            .iter()
            .map(|agent| SingleResourceRequest {
                agent_id: agent.id.clone(),
                weight: self.weight_of(weights, &agent.id),
                minimum: agent.minimum(resource),
                ideal: agent.ideal(resource),
            })
            .collect();

        let result = self.waterfill.solve(&requests, group.available.get(resource));
        JointAllocationResult {
            allocations: result
                .allocations
                .into_iter()
                .map(|(id, quantity)| (id, ResourceBundle::new().with(resource, quantity)))
                .collect(),
            objective: result.objective,
            feasible: result.feasible,
            message: result.message,
            elapsed: result.elapsed,
        }
    }

    /// The proportional-fairness mechanism: each contested resource is
    /// water-filled independently, in ordinal order.
    fn sequential_waterfill(
        &self,
        group: &ContentionGroup,
        members: &[&Agent],
        weights: &BTreeMap<String, f64>,
    ) -> JointAllocationResult {
        let start = Instant::now();
        let mut allocations: BTreeMap<String, ResourceBundle> = members
            .iter()
            .map(|agent| (agent.id.clone(), ResourceBundle::new()))
            .collect();

        for &resource in &group.resources {
            let requests: Vec<SingleResourceRequest> = members
                .iter()
                .map(|agent| SingleResourceRequest {
                    agent_id: agent.id.clone(),
                    weight: self.weight_of(weights, &agent.id),
                    minimum: agent.minimum(resource),
                    ideal: agent.ideal(resource),
                })
                .collect();

            let result = self.waterfill.solve(&requests, group.available.get(resource));
            if !result.feasible {
                return JointAllocationResult::infeasible(format!(
                    "{resource}: {}",
                    result.message
                ));
            }
            for (agent_id, quantity) in result.allocations {
                allocations
                    .get_mut(&agent_id)
                    .expect("initialized above")
                    .set(resource, quantity);
            }
        }

        let objective = members
            .iter()
            .map(|agent| {
                let value = agent.utility.evaluate_bundle(&allocations[&agent.id]);
                self.weight_of(weights, &agent.id) * value.max(EPSILON).ln()
            })
            .sum();

        JointAllocationResult {
            allocations,
            objective,
            feasible: true,
            message: "sequential water-filling per resource".to_string(),
            elapsed: start.elapsed(),
        }
    }

    fn weight_of(&self, weights: &BTreeMap<String, f64>, agent_id: &str) -> f64 {
        weights
            .get(agent_id)
            .copied()
            .unwrap_or_else(|| self.economy.priority_weight(Decimal::ZERO))
    }

    fn proposal_welfare(&self, proposal: &Proposal) -> f64 {
        proposal
            .iter()
            .filter_map(|(agent_id, bundle)| {
                let agent = self.agents.get(agent_id)?;
                let weight = self.economy.priority_weight(agent.burn);
                Some(weight * agent.utility.evaluate_bundle(bundle).max(EPSILON).ln())
            })
            .sum()
    }

    /// Voluntary release outside a cycle: hand quantity back to the pool
    /// and earn currency scaled by the smoothed demand multiplier.
    pub fn release(
        &mut self,
        agent_id: &str,
        resource: ResourceType,
        quantity: u64,
        time_remaining_fraction: f64,
    ) -> Result<Decimal, SchedulerError> {
        let holding = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?
            .allocation
            .get(resource);
        if holding < quantity {
            return Err(SchedulerError::NothingToRelease {
                agent_id: agent_id.to_string(),
                resource,
                quantity,
            });
        }

        self.pool.release(resource, quantity)?;
        let snapshot = self.pool.snapshot();
        let earnings =
            self.economy
                .release_earnings(resource, quantity, time_remaining_fraction, &snapshot);

        let agent = self.agents.get_mut(agent_id).expect("checked above");
        agent.allocation.saturating_sub(resource, quantity);
        agent.balance = self.economy.credit_release(agent.balance, earnings);

        tracing::info!(
            agent = agent_id,
            %resource,
            quantity,
            %earnings,
            "resources released for earnings"
        );
        Ok(earnings)
    }

    /// Run all five invariants against the current committed state.
    pub fn verify_state(&self) -> Result<SafetyReport, SafetyViolation> {
        let proposal: Proposal = self
            .agents
            .values()
            .map(|agent| (agent.id.clone(), agent.allocation.clone()))
            .collect();
        let capacities: ResourceBundle = ResourceType::ALL
            .iter()
            .map(|&r| (r, self.pool.total(r)))
            .collect();
        let balances: BTreeMap<String, Decimal> = self
            .agents
            .values()
            .map(|agent| (agent.id.clone(), agent.balance))
            .collect();

        self.transactions.monitor().verify_full(
            &proposal,
            &capacities,
            &self.agents,
            &balances,
            self.economy.config().balance_floor,
            self.economy.ledger().expected_total(),
        )
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> &BTreeMap<String, Agent> {
        &self.agents
    }

    pub fn economy(&self) -> &PriorityEconomy {
        &self.economy
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.transactions
    }
}
