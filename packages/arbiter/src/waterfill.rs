//! FairShare-Arbiter: Water-Filling Single-Resource Solver
//!
//! Exact weighted proportional fairness on one resource axis:
//!
//! ```text
//! max Σ wᵢ·log(aᵢ)   s.t.  Σ aᵢ <= Q,  minᵢ <= aᵢ <= idealᵢ
//! ```
//!
//! Agents start at their minimums; the remaining supply is poured in
//! proportion to weight, freezing each agent as it hits its ideal (the
//! bottleneck each round), until the water level settles. The continuous
//! optimum is then rounded by largest remainder.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use fairshare_core::{AllocationResult, EPSILON};

use crate::rounding::largest_remainder;

const MAX_ROUNDS: usize = 100;

/// One agent's stake in a single-resource arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleResourceRequest {
    pub agent_id: String,
    /// Priority weight (base + burn)
    pub weight: f64,
    pub minimum: u64,
    pub ideal: u64,
}

/// Exact PF solver for one resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaterFillingArbitrator;

impl WaterFillingArbitrator {
    pub fn new() -> Self {
        Self
    }

    /// Solve for integer allocations over `supply` units.
    ///
    /// Infeasible only when the minimums alone exceed supply; that returns
    /// a distinguished result and commits nothing.
    pub fn solve(&self, requests: &[SingleResourceRequest], supply: u64) -> AllocationResult {
        let start = Instant::now();
        let n = requests.len();

        if n == 0 {
            return AllocationResult {
                allocations: Default::default(),
                objective: 0.0,
                feasible: true,
                message: "no competing agents".to_string(),
                elapsed: start.elapsed(),
            };
        }

        let total_minimum: u64 = requests.iter().map(|r| r.minimum).sum();
        if total_minimum > supply {
            return AllocationResult::infeasible(format!(
                "total minimum {total_minimum} exceeds supply {supply}"
            ));
        }

        let continuous = self.solve_continuous(requests, supply);

        let minimums: Vec<u64> = requests.iter().map(|r| r.minimum).collect();
        let ideals: Vec<u64> = requests.iter().map(|r| r.ideal).collect();
        let integral = largest_remainder(&continuous, &minimums, &ideals);

        let objective = requests
            .iter()
            .zip(&integral)
            .map(|(r, &a)| r.weight * (a as f64).max(EPSILON).ln())
            .sum();

        AllocationResult {
            allocations: requests
                .iter()
                .zip(&integral)
                .map(|(r, &a)| (r.agent_id.clone(), a))
                .collect(),
            objective,
            feasible: true,
            message: "water-filling solved to optimality".to_string(),
            elapsed: start.elapsed(),
        }
    }

    /// The continuous water level, before rounding.
    fn solve_continuous(&self, requests: &[SingleResourceRequest], supply: u64) -> Vec<f64> {
        let n = requests.len();
        let mut alloc: Vec<f64> = requests.iter().map(|r| r.minimum as f64).collect();
        let mut frozen = vec![false; n];
        let mut remaining = supply as f64 - alloc.iter().sum::<f64>();

        for _ in 0..MAX_ROUNDS {
            if remaining <= EPSILON {
                break;
            }

            let active: Vec<usize> = (0..n)
                .filter(|&i| !frozen[i] && alloc[i] < requests[i].ideal as f64 - EPSILON)
                .collect();
            if active.is_empty() {
                break;
            }

            let active_weight: f64 = active.iter().map(|&i| requests[i].weight).sum();
            if active_weight < EPSILON {
                // Weightless agents still split the water evenly, up to
                // each one's slack.
                let share = remaining / active.len() as f64;
                for &i in &active {
                    let slack = requests[i].ideal as f64 - alloc[i];
                    alloc[i] += share.min(slack);
                }
                remaining = 0.0;
                break;
            }

            // Tentative proportional shares and the bottleneck fill factor.
            let mut fill = f64::INFINITY;
            let mut bottleneck = None;
            for &i in &active {
                let share = requests[i].weight / active_weight * remaining;
                let slack = requests[i].ideal as f64 - alloc[i];
                if share > slack && slack / share < fill {
                    fill = slack / share;
                    bottleneck = Some(i);
                }
            }

            let Some(stuck) = bottleneck.filter(|_| fill < 1.0) else {
                for &i in &active {
                    alloc[i] += requests[i].weight / active_weight * remaining;
                }
                remaining = 0.0;
                break;
            };

            // Advance to the bottleneck, freeze it at its ideal, and keep
            // pouring next round.
            for &i in &active {
                alloc[i] += requests[i].weight / active_weight * remaining * fill;
            }
            remaining -= remaining * fill;
            alloc[stuck] = requests[stuck].ideal as f64;
            frozen[stuck] = true;
        }

        // Tiny residual lands on whoever still has slack, in input order.
        if remaining > EPSILON {
            for i in 0..n {
                let slack = requests[i].ideal as f64 - alloc[i];
                if slack > 0.0 {
                    let poured = remaining.min(slack);
                    alloc[i] += poured;
                    remaining -= poured;
                    if remaining <= EPSILON {
                        break;
                    }
                }
            }
        }

        alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, weight: f64, minimum: u64, ideal: u64) -> SingleResourceRequest {
        SingleResourceRequest {
            agent_id: id.to_string(),
            weight,
            minimum,
            ideal,
        }
    }

    #[test]
    fn test_equal_weights_split_proportionally_after_minimums() {
        let solver = WaterFillingArbitrator::new();
        let result = solver.solve(
            &[request("a1", 10.0, 40, 80), request("a2", 10.0, 30, 70)],
            100,
        );

        assert!(result.feasible);
        assert_eq!(result.allocations["a1"], 55);
        assert_eq!(result.allocations["a2"], 45);
    }

    #[test]
    fn test_burn_tilts_the_split() {
        let solver = WaterFillingArbitrator::new();
        // a1 burned 50 on top of the base weight of 10
        let result = solver.solve(
            &[request("a1", 60.0, 40, 80), request("a2", 10.0, 30, 70)],
            100,
        );

        assert_eq!(result.allocations["a1"], 66);
        assert_eq!(result.allocations["a2"], 34);
    }

    #[test]
    fn test_infeasible_when_minimums_exceed_supply() {
        let solver = WaterFillingArbitrator::new();
        let result = solver.solve(
            &[request("a1", 10.0, 60, 80), request("a2", 10.0, 50, 70)],
            100,
        );

        assert!(!result.feasible);
        assert!(result.allocations.is_empty());
        assert!(result.message.contains("110"));
    }

    #[test]
    fn test_ideals_freeze_and_water_flows_on() {
        let solver = WaterFillingArbitrator::new();
        // a1 saturates at 10; the rest flows to a2
        let result = solver.solve(
            &[request("a1", 10.0, 0, 10), request("a2", 10.0, 0, 100)],
            60,
        );

        assert_eq!(result.allocations["a1"], 10);
        assert_eq!(result.allocations["a2"], 50);
    }

    #[test]
    fn test_supply_beyond_ideals_leaves_surplus_unallocated() {
        let solver = WaterFillingArbitrator::new();
        let result = solver.solve(
            &[request("a1", 10.0, 0, 20), request("a2", 10.0, 0, 30)],
            100,
        );

        assert_eq!(result.allocations["a1"], 20);
        assert_eq!(result.allocations["a2"], 30);
    }

    #[test]
    fn test_zero_weights_split_evenly() {
        let solver = WaterFillingArbitrator::new();
        let result = solver.solve(
            &[request("a1", 0.0, 0, 100), request("a2", 0.0, 0, 100)],
            50,
        );

        assert_eq!(result.allocations["a1"], 25);
        assert_eq!(result.allocations["a2"], 25);
    }

    #[test]
    fn test_matches_kkt_optimum_within_tolerance() {
        // Three agents, no binding box constraints after minimums: the
        // interior optimum allocates remaining supply proportional to
        // weight. Compare the continuous objective against the closed form.
        let requests = vec![
            request("a", 2.0, 10, 1000),
            request("b", 3.0, 10, 1000),
            request("c", 5.0, 10, 1000),
        ];
        let solver = WaterFillingArbitrator::new();
        let continuous = solver.solve_continuous(&requests, 130);

        let remaining: f64 = 100.0;
        let expected: [f64; 3] = [
            10.0 + 2.0 / 10.0 * remaining,
            10.0 + 3.0 / 10.0 * remaining,
            10.0 + 5.0 / 10.0 * remaining,
        ];

        let objective: f64 = requests
            .iter()
            .zip(&continuous)
            .map(|(r, &a)| r.weight * a.ln())
            .sum();
        let optimal: f64 = requests
            .iter()
            .zip(&expected)
            .map(|(r, &a)| r.weight * a.ln())
            .sum();

        assert!(
            (objective - optimal).abs() / optimal.abs() < 1e-6,
            "objective {objective} vs optimum {optimal}"
        );
    }

    #[test]
    fn test_burn_monotonicity() {
        // Raising one agent's weight never shrinks its share.
        let solver = WaterFillingArbitrator::new();
        let mut previous = 0;
        for burn in [0.0, 10.0, 25.0, 50.0, 100.0] {
            let result = solver.solve(
                &[
                    request("riser", 10.0 + burn, 10, 90),
                    request("other", 10.0, 10, 90),
                ],
                100,
            );
            let share = result.allocations["riser"];
            assert!(share >= previous, "share dropped at burn {burn}");
            previous = share;
        }
    }

    #[test]
    fn test_determinism() {
        let requests = vec![
            request("x", 12.5, 5, 40),
            request("y", 7.5, 10, 60),
            request("z", 10.0, 0, 35),
        ];
        let solver = WaterFillingArbitrator::new();
        let first = solver.solve(&requests, 80);
        for _ in 0..10 {
            let again = solver.solve(&requests, 80);
            assert_eq!(first.allocations, again.allocations);
        }
    }
}
