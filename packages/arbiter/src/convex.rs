//! FairShare-Arbiter: Convex Joint Solver (Out-of-Process)
//!
//! Exact path for the joint problem: the problem is serialized as
//! canonical JSON and handed to an external convex solver (an
//! exponential-cone interior-point program) over stdin/stdout. Matrix
//! columns are aligned by resource ordinal and agents follow the input
//! order; both sides must agree on that or the columns silently misalign.
//!
//! The solver child is bounded by a timeout and killed on expiry. Any
//! failure (unreachable binary, timeout, non-optimal status, unparsable
//! output) falls back transparently to the in-process gradient solver;
//! the caller can only tell which path ran from the result message.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use fairshare_core::{JointAllocationResult, ResourceBundle};

use crate::gradient::GradientJointArbitrator;
use crate::rounding::largest_remainder;
use crate::solver::{JointArbitrator, JointProblem};

/// Request wire format. All matrices are `n_agents x n_resources`,
/// columns in resource ordinal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvexProblem {
    pub n_agents: usize,
    pub n_resources: usize,
    pub preferences: Vec<Vec<f64>>,
    pub priority_weights: Vec<f64>,
    pub capacities: Vec<f64>,
    pub minimums: Vec<Vec<f64>>,
    pub ideals: Vec<Vec<f64>>,
}

impl ConvexProblem {
    pub fn from_joint(problem: &JointProblem) -> Self {
        let matrix = |f: &dyn Fn(usize, usize) -> f64| -> Vec<Vec<f64>> {
            (0..problem.agents.len())
                .map(|i| (0..problem.resources.len()).map(|j| f(i, j)).collect())
                .collect()
        };

        Self {
            n_agents: problem.agents.len(),
            n_resources: problem.resources.len(),
            preferences: matrix(&|i, j| {
                problem.agents[i]
                    .utility
                    .preference_weight(problem.resources[j])
            }),
            priority_weights: problem.agents.iter().map(|a| a.weight).collect(),
            capacities: problem
                .resources
                .iter()
                .map(|&r| problem.capacities.get(r) as f64)
                .collect(),
            minimums: matrix(&|i, j| problem.agents[i].minimums.get(problem.resources[j]) as f64),
            ideals: matrix(&|i, j| problem.agents[i].ideals.get(problem.resources[j]) as f64),
        }
    }
}

/// Response wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvexSolution {
    pub status: String,
    #[serde(default)]
    pub objective: f64,
    #[serde(default)]
    pub allocations: Vec<Vec<f64>>,
}

/// Why the exact path was abandoned for a given solve.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("solver process error: {0}")]
    Io(#[from] std::io::Error),

    #[error("solver timed out after {0:?}")]
    Timeout(Duration),

    #[error("solver exited with status {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },

    #[error("solver output unparsable: {0}")]
    Unparsable(String),

    #[error("solver reported status {status:?}")]
    NonOptimal { status: String },

    #[error("solver returned a {rows}x{cols} matrix, expected {expected_rows}x{expected_cols}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
}

/// Subprocess invocation settings for the exact solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvexSolverConfig {
    /// Solver executable
    pub command: String,
    /// Arguments passed verbatim
    #[serde(default)]
    pub args: Vec<String>,
    /// Wall-clock bound; the child is killed on expiry
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl ConvexSolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Exact joint arbitrator with transparent gradient fallback.
pub struct ConvexJointArbitrator {
    config: ConvexSolverConfig,
    fallback: GradientJointArbitrator,
}

impl ConvexJointArbitrator {
    pub fn new(config: ConvexSolverConfig) -> Self {
        Self {
            config,
            fallback: GradientJointArbitrator::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: GradientJointArbitrator) -> Self {
        self.fallback = fallback;
        self
    }

    async fn run_solver(&self, problem: &JointProblem) -> Result<ConvexSolution, SolverError> {
        let payload = serde_json::to_vec(&ConvexProblem::from_joint(problem))
            .map_err(|e| SolverError::Unparsable(e.to_string()))?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        // On timeout the output future is dropped, which kills the child.
        let output = tokio::time::timeout(self.config.timeout(), child.wait_with_output())
            .await
            .map_err(|_| SolverError::Timeout(self.config.timeout()))??;

        if !output.status.success() {
            return Err(SolverError::NonZeroExit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let solution: ConvexSolution = serde_json::from_slice(&output.stdout)
            .map_err(|e| SolverError::Unparsable(e.to_string()))?;

        if solution.status != "optimal" {
            return Err(SolverError::NonOptimal {
                status: solution.status,
            });
        }

        let rows = solution.allocations.len();
        let cols = solution.allocations.first().map(Vec::len).unwrap_or(0);
        if rows != problem.agents.len()
            || solution.allocations.iter().any(|r| r.len() != problem.resources.len())
        {
            return Err(SolverError::ShapeMismatch {
                rows,
                cols,
                expected_rows: problem.agents.len(),
                expected_cols: problem.resources.len(),
            });
        }

        Ok(solution)
    }

    /// Round the exact continuous solution per resource column, same
    /// largest-remainder scheme as the gradient path.
    fn integerize(
        &self,
        problem: &JointProblem,
        solution: &ConvexSolution,
    ) -> BTreeMap<String, ResourceBundle> {
        let n = problem.agents.len();
        let mut allocations: BTreeMap<String, ResourceBundle> = problem
            .agents
            .iter()
            .map(|a| (a.agent_id.clone(), ResourceBundle::new()))
            .collect();

        for (j, &resource) in problem.resources.iter().enumerate() {
            let column: Vec<f64> = (0..n).map(|i| solution.allocations[i][j]).collect();
            let minimums: Vec<u64> = problem
                .agents
                .iter()
                .map(|a| a.minimums.get(resource))
                .collect();
            let ideals: Vec<u64> = problem.agents.iter().map(|a| a.ideals.get(resource)).collect();

            let integral = largest_remainder(&column, &minimums, &ideals);
            for (i, agent) in problem.agents.iter().enumerate() {
                allocations
                    .get_mut(&agent.agent_id)
                    .expect("initialized above")
                    .set(resource, integral[i]);
            }
        }

        allocations
    }
}

#[async_trait]
impl JointArbitrator for ConvexJointArbitrator {
    async fn solve(&self, problem: &JointProblem) -> JointAllocationResult {
        let start = Instant::now();

        if let Some((resource, minimum, capacity)) = problem.infeasible_resource() {
            return JointAllocationResult::infeasible(format!(
                "{resource}: total minimum {minimum} exceeds capacity {capacity}"
            ));
        }

        match self.run_solver(problem).await {
            Ok(solution) => {
                let allocations = self.integerize(problem, &solution);
                let objective = problem.welfare(&allocations);
                JointAllocationResult {
                    allocations,
                    objective,
                    feasible: true,
                    message: "exact convex solver returned optimal".to_string(),
                    elapsed: start.elapsed(),
                }
            }
            Err(err) => {
                tracing::warn!(%err, "exact solver unavailable, using gradient fallback");
                let mut result = self.fallback.solve_sync(problem);
                result.message = format!("exact path unavailable ({err}); {}", result.message);
                result.elapsed = start.elapsed();
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::AgentDemand;
    use fairshare_core::{ResourceType, UtilityFunction};

    const C: ResourceType = ResourceType::Compute;
    const M: ResourceType = ResourceType::Memory;

    fn demand(id: &str, weight: f64, minimum: u64, ideal: u64) -> AgentDemand {
        AgentDemand {
            agent_id: id.to_string(),
            weight,
            minimums: ResourceBundle::new().with(C, minimum),
            ideals: ResourceBundle::new().with(C, ideal),
            utility: UtilityFunction::uniform_linear(&[C]),
        }
    }

    fn problem() -> JointProblem {
        JointProblem {
            agents: vec![demand("a1", 10.0, 40, 80), demand("a2", 10.0, 30, 70)],
            resources: vec![C],
            capacities: ResourceBundle::new().with(C, 100),
        }
    }

    #[test]
    fn test_wire_format_field_names_and_shapes() {
        let wire = ConvexProblem::from_joint(&problem());
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["n_agents"], 2);
        assert_eq!(json["n_resources"], 1);
        assert_eq!(json["priority_weights"].as_array().unwrap().len(), 2);
        assert_eq!(json["capacities"][0], 100.0);
        assert_eq!(json["minimums"][0][0], 40.0);
        assert_eq!(json["ideals"][1][0], 70.0);
    }

    #[test]
    fn test_wire_round_trip_is_stable() {
        let wire = ConvexProblem::from_joint(&problem());
        let json = serde_json::to_string(&wire).unwrap();
        let back: ConvexProblem = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_response_parsing_tolerates_whitespace() {
        let pretty = r#"{
            "status": "optimal",
            "objective": 12.5,
            "allocations": [
                [55.0],
                [45.0]
            ]
        }"#;
        let solution: ConvexSolution = serde_json::from_str(pretty).unwrap();
        assert_eq!(solution.status, "optimal");
        assert_eq!(solution.allocations[0][0], 55.0);
    }

    #[test]
    fn test_columns_follow_resource_ordinal_order() {
        let joint = JointProblem {
            agents: vec![AgentDemand {
                agent_id: "a".to_string(),
                weight: 10.0,
                minimums: ResourceBundle::new(),
                ideals: ResourceBundle::new().with(M, 10).with(C, 20),
                utility: UtilityFunction::Linear {
                    weights: [(C, 1.0), (M, 2.0)].into_iter().collect(),
                },
            }],
            resources: vec![C, M],
            capacities: ResourceBundle::new().with(C, 20).with(M, 10),
        };

        let wire = ConvexProblem::from_joint(&joint);
        // Compute (ordinal 0) before Memory (ordinal 1)
        assert_eq!(wire.ideals[0], vec![20.0, 10.0]);
        assert_eq!(wire.preferences[0], vec![1.0, 2.0]);
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;

        fn sh_solver(script: &str, timeout_ms: u64) -> ConvexJointArbitrator {
            ConvexJointArbitrator::new(ConvexSolverConfig {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                timeout_ms,
            })
        }

        #[tokio::test]
        async fn test_optimal_solution_is_used() {
            let script = r#"cat > /dev/null; echo '{"status": "optimal", "objective": 81.0, "allocations": [[55.2], [44.8]]}'"#;
            let solver = sh_solver(script, 5_000);

            let result = solver.solve(&problem()).await;
            assert!(result.feasible);
            assert!(result.message.contains("exact"));
            assert!(!result.message.contains("unavailable"));
            assert_eq!(result.allocations["a1"].get(C), 55);
            assert_eq!(result.allocations["a2"].get(C), 45);
        }

        #[tokio::test]
        async fn test_missing_binary_falls_back() {
            let solver = ConvexJointArbitrator::new(ConvexSolverConfig {
                command: "fairshare-solver-that-does-not-exist".to_string(),
                args: vec![],
                timeout_ms: 1_000,
            });

            let result = solver.solve(&problem()).await;
            assert!(result.feasible);
            assert!(result.message.contains("exact path unavailable"));
            // Fallback still honors the box
            assert!(result.allocations["a1"].get(C) >= 40);
        }

        #[tokio::test]
        async fn test_non_optimal_status_falls_back() {
            let script =
                r#"cat > /dev/null; echo '{"status": "infeasible", "objective": 0, "allocations": []}'"#;
            let solver = sh_solver(script, 5_000);

            let result = solver.solve(&problem()).await;
            assert!(result.message.contains("exact path unavailable"));
        }

        #[tokio::test]
        async fn test_garbage_output_falls_back() {
            let script = r#"cat > /dev/null; echo 'not json at all'"#;
            let solver = sh_solver(script, 5_000);

            let result = solver.solve(&problem()).await;
            assert!(result.message.contains("exact path unavailable"));
        }

        #[tokio::test]
        async fn test_timeout_falls_back() {
            let script = r#"cat > /dev/null; sleep 30"#;
            let solver = sh_solver(script, 200);

            let result = solver.solve(&problem()).await;
            assert!(result.message.contains("exact path unavailable"));
        }

        #[tokio::test]
        async fn test_shape_mismatch_falls_back() {
            let script =
                r#"cat > /dev/null; echo '{"status": "optimal", "objective": 1, "allocations": [[55.0]]}'"#;
            let solver = sh_solver(script, 5_000);

            let result = solver.solve(&problem()).await;
            assert!(result.message.contains("exact path unavailable"));
        }
    }
}
