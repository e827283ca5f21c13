//! FairShare-Arbiter: Grouping Policy & Splitter
//!
//! Contention components can grow beyond what a joint solve should chew
//! on. The grouping policy bounds them four ways: a pairwise k-hop limit
//! in the contention graph, a compatibility matrix, a hard size cap with a
//! pluggable split strategy, and a minimum group size below which the
//! policy is considered degenerate for that group.
//!
//! When several split groups share a pool resource in the same cycle, the
//! splitter pre-partitions the available supply across them proportional
//! to ideal demand; without that the per-group solves can jointly exceed
//! capacity.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use fairshare_core::{Agent, ContentionGroup, PoolSnapshot, ResourceType};

use crate::detector::{ContentionGraph, UnionFind};

/// Seed for the spectral split's power iteration start vector.
const SPECTRAL_SEED: u64 = 0x5eed_0f1e;
const SPECTRAL_ITERATIONS: usize = 50;

/// Who may share a group with whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompatibilityMatrix {
    /// Only the listed unordered pairs may coexist
    Allowlist { pairs: Vec<(String, String)> },
    /// Every pair may coexist except the listed ones
    Blocklist { pairs: Vec<(String, String)> },
    /// Agents sharing a category label may coexist; unlabeled agents are
    /// compatible with anyone
    Category { labels: BTreeMap<String, String> },
}

impl CompatibilityMatrix {
    fn has_pair(pairs: &[(String, String)], a: &str, b: &str) -> bool {
        pairs
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    pub fn compatible(&self, a: &str, b: &str) -> bool {
        match self {
            CompatibilityMatrix::Allowlist { pairs } => Self::has_pair(pairs, a, b),
            CompatibilityMatrix::Blocklist { pairs } => !Self::has_pair(pairs, a, b),
            CompatibilityMatrix::Category { labels } => {
                match (labels.get(a), labels.get(b)) {
                    (Some(la), Some(lb)) => la == lb,
                    _ => true,
                }
            }
        }
    }
}

/// How an oversized group is cut down to the size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Greedy partition cutting the fewest contention edges
    #[default]
    MinCut,
    /// K-means-style clustering on normalized demand vectors
    ResourceAffinity,
    /// Windows of descending currency balance
    PriorityClustering,
    /// Windows of input order
    RoundRobin,
    /// Order by an approximate Fiedler vector, then window
    Spectral,
}

/// The four knobs bounding group formation. The default policy is
/// unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GroupingPolicy {
    /// Every pair of members must be within this many hops in the
    /// contention graph
    pub k_hop_limit: Option<usize>,
    /// Hard cap on member count
    pub max_group_size: Option<usize>,
    /// Groups smaller than this mark the policy degenerate for that group
    pub min_group_size: usize,
    pub compatibility: Option<CompatibilityMatrix>,
    pub split_strategy: SplitStrategy,
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl GroupingPolicy {
    pub fn unlimited() -> Self {
        Self {
            k_hop_limit: None,
            max_group_size: None,
            min_group_size: 1,
            compatibility: None,
            split_strategy: SplitStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.min_group_size < 1 {
            return Err(PolicyError::InvalidKnob {
                knob: "min_group_size",
            });
        }
        if self.k_hop_limit == Some(0) {
            return Err(PolicyError::InvalidKnob { knob: "k_hop_limit" });
        }
        if self.max_group_size == Some(0) {
            return Err(PolicyError::InvalidKnob {
                knob: "max_group_size",
            });
        }
        Ok(())
    }
}

/// Grouping policy errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid grouping policy knob: {knob}")]
    InvalidKnob { knob: &'static str },
}

/// Applies a [`GroupingPolicy`] to detected contention groups.
pub struct GroupSplitter {
    policy: GroupingPolicy,
}

impl Default for GroupSplitter {
    fn default() -> Self {
        Self::new(GroupingPolicy::unlimited())
    }
}

impl GroupSplitter {
    pub fn new(policy: GroupingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GroupingPolicy {
        &self.policy
    }

    /// Split every group per the policy, rebuild resource/supply maps, and
    /// partition shared supply across the resulting groups.
    pub fn split(
        &self,
        groups: &[ContentionGroup],
        graph: &ContentionGraph,
        agents: &BTreeMap<String, Agent>,
        pool: &PoolSnapshot,
    ) -> Vec<ContentionGroup> {
        let mut output = Vec::new();

        for group in groups {
            let mut parts = vec![group.agent_ids.clone()];
            let mut note = None;

            if let Some(k) = self.policy.k_hop_limit {
                parts = parts
                    .into_iter()
                    .flat_map(|part| self.k_hop_split(part, graph, k))
                    .collect();
            }

            if let Some(matrix) = &self.policy.compatibility {
                parts = parts
                    .into_iter()
                    .flat_map(|part| self.compatibility_split(part, matrix))
                    .collect();
            }

            if let Some(max) = self.policy.max_group_size {
                parts = parts
                    .into_iter()
                    .flat_map(|part| {
                        if part.len() > max {
                            self.size_split(part, max, graph, agents)
                        } else {
                            vec![part]
                        }
                    })
                    .collect();
            }

            let degenerate = parts.is_empty()
                || parts
                    .iter()
                    .any(|p| p.is_empty() || p.len() < self.policy.min_group_size);
            if degenerate {
                tracing::warn!(
                    group = group.id,
                    "grouping policy degenerate for this group, falling back to unlimited"
                );
                parts = vec![group.agent_ids.clone()];
                note = Some("degenerate grouping policy; fell back to unlimited".to_string());
            }

            for part in parts {
                let mut rebuilt = ContentionGroup::new(output.len() as u32, part);
                for agent_id in &rebuilt.agent_ids {
                    if let Some(agent) = agents.get(agent_id) {
                        rebuilt.resources.extend(agent.demanded_resources());
                    }
                }
                rebuilt.available = pool.restricted_to(rebuilt.resources.iter());
                rebuilt.note = note.clone();
                output.push(rebuilt);
            }
        }

        self.partition_shared_supply(&mut output, agents, pool);
        output
    }

    /// Greedy pairwise k-hop grouping: grow each group from the first
    /// unassigned seed, admitting a candidate only when it is within `k`
    /// hops of every current member. Tie-break is the insertion order of
    /// the member list.
    fn k_hop_split(
        &self,
        members: Vec<String>,
        graph: &ContentionGraph,
        k: usize,
    ) -> Vec<Vec<String>> {
        let distances: BTreeMap<String, BTreeMap<String, usize>> = members
            .iter()
            .map(|id| (id.clone(), graph.distances_from(id)))
            .collect();
        let within = |a: &str, b: &str| -> bool {
            distances
                .get(a)
                .and_then(|d| d.get(b))
                .map(|&d| d <= k)
                .unwrap_or(false)
        };

        let mut unassigned = members;
        let mut parts = Vec::new();
        while !unassigned.is_empty() {
            let seed = unassigned.remove(0);
            let mut part = vec![seed];
            let mut rest = Vec::new();
            for candidate in unassigned {
                if part.iter().all(|member| within(member, &candidate)) {
                    part.push(candidate);
                } else {
                    rest.push(candidate);
                }
            }
            unassigned = rest;
            parts.push(part);
        }
        parts
    }

    /// Split by connected components of the compatibility graph restricted
    /// to the group's members.
    fn compatibility_split(
        &self,
        members: Vec<String>,
        matrix: &CompatibilityMatrix,
    ) -> Vec<Vec<String>> {
        let n = members.len();
        let mut union_find = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if matrix.compatible(&members[i], &members[j]) {
                    union_find.union(i, j);
                }
            }
        }

        let mut parts_by_root: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut root_order = Vec::new();
        for (i, member) in members.into_iter().enumerate() {
            let root = union_find.find(i);
            let entry = parts_by_root.entry(root).or_default();
            if entry.is_empty() {
                root_order.push(root);
            }
            entry.push(member);
        }

        root_order
            .into_iter()
            .map(|root| parts_by_root.remove(&root).expect("inserted above"))
            .collect()
    }

    fn size_split(
        &self,
        members: Vec<String>,
        max: usize,
        graph: &ContentionGraph,
        agents: &BTreeMap<String, Agent>,
    ) -> Vec<Vec<String>> {
        match self.policy.split_strategy {
            SplitStrategy::RoundRobin => chunk(members, max),
            SplitStrategy::PriorityClustering => {
                let mut ordered = members;
                ordered.sort_by(|a, b| {
                    let balance_a = agents.get(a).map(|x| x.balance).unwrap_or_default();
                    let balance_b = agents.get(b).map(|x| x.balance).unwrap_or_default();
                    balance_b.cmp(&balance_a)
                });
                chunk(ordered, max)
            }
            SplitStrategy::MinCut => self.min_cut_split(members, max, graph),
            SplitStrategy::ResourceAffinity => self.affinity_split(members, max, agents),
            SplitStrategy::Spectral => self.spectral_split(members, max, graph),
        }
    }

    /// Order by descending contention degree, then greedily place each
    /// agent where it cuts the fewest contention edges (ties: lowest
    /// partition index), respecting the size cap.
    fn min_cut_split(
        &self,
        members: Vec<String>,
        max: usize,
        graph: &ContentionGraph,
    ) -> Vec<Vec<String>> {
        let member_set: BTreeSet<&str> = members.iter().map(String::as_str).collect();
        let degree_within = |id: &String| -> usize {
            graph.neighbors(id).filter(|n| member_set.contains(n)).count()
        };

        let partitions_count = members.len().div_ceil(max);
        let mut ordered = members.clone();
        ordered.sort_by_key(|id| std::cmp::Reverse(degree_within(id)));

        let mut partitions: Vec<Vec<String>> = vec![Vec::new(); partitions_count];
        for agent_id in ordered {
            let neighbors: BTreeSet<String> = graph
                .neighbors(&agent_id)
                .map(str::to_string)
                .collect();

            let mut best: Option<(usize, usize)> = None; // (cut_edges, index)
            for (index, partition) in partitions.iter().enumerate() {
                if partition.len() >= max {
                    continue;
                }
                let cut: usize = partitions
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != index)
                    .map(|(_, p)| p.iter().filter(|m| neighbors.contains(*m)).count())
                    .sum();
                if best.map(|(c, _)| cut < c).unwrap_or(true) {
                    best = Some((cut, index));
                }
            }

            let (_, index) = best.expect("partition count covers all members");
            partitions[index].push(agent_id);
        }

        partitions.retain(|p| !p.is_empty());
        partitions
    }

    /// K-means-style split over normalized demand vectors: far-apart
    /// seeds, then nearest-centroid assignment under the size cap.
    fn affinity_split(
        &self,
        members: Vec<String>,
        max: usize,
        agents: &BTreeMap<String, Agent>,
    ) -> Vec<Vec<String>> {
        let vector_of = |id: &String| -> Vec<f64> {
            let Some(agent) = agents.get(id) else {
                return vec![0.0; ResourceType::ALL.len()];
            };
            let total = agent.ideals.total() as f64;
            ResourceType::ALL
                .iter()
                .map(|&r| {
                    if total > 0.0 {
                        agent.ideal(r) as f64 / total
                    } else {
                        0.0
                    }
                })
                .collect()
        };
        let distance = |a: &[f64], b: &[f64]| -> f64 {
            a.iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt()
        };

        let vectors: BTreeMap<String, Vec<f64>> = members
            .iter()
            .map(|id| (id.clone(), vector_of(id)))
            .collect();

        let k = members.len().div_ceil(max);
        let mut seeds: Vec<String> = vec![members[0].clone()];
        while seeds.len() < k {
            let next = members
                .iter()
                .filter(|m| !seeds.contains(m))
                .max_by(|a, b| {
                    let min_distance = |candidate: &str| {
                        seeds
                            .iter()
                            .map(|s| distance(&vectors[candidate], &vectors[s.as_str()]))
                            .fold(f64::INFINITY, f64::min)
                    };
                    min_distance(a.as_str())
                        .partial_cmp(&min_distance(b.as_str()))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("k <= member count");
            seeds.push(next.clone());
        }

        let centroids: Vec<Vec<f64>> = seeds.iter().map(|s| vectors[s.as_str()].clone()).collect();
        let mut partitions: Vec<Vec<String>> = vec![Vec::new(); k];
        for member in &members {
            let mut order: Vec<usize> = (0..k).collect();
            order.sort_by(|&a, &b| {
                distance(&vectors[member.as_str()], &centroids[a])
                    .partial_cmp(&distance(&vectors[member.as_str()], &centroids[b]))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let slot = order
                .into_iter()
                .find(|&i| partitions[i].len() < max)
                .expect("k partitions of size max cover all members");
            partitions[slot].push(member.clone());
        }

        partitions.retain(|p| !p.is_empty());
        partitions
    }

    /// Approximate Fiedler ordering: power iteration on the shifted
    /// normalized Laplacian, orthogonalized against the all-ones vector,
    /// then window the sorted order.
    fn spectral_split(
        &self,
        members: Vec<String>,
        max: usize,
        graph: &ContentionGraph,
    ) -> Vec<Vec<String>> {
        let n = members.len();
        let index_of: BTreeMap<&str, usize> = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.as_str(), i))
            .collect();

        let mut adjacency = vec![vec![0.0f64; n]; n];
        let mut degree = vec![0.0f64; n];
        for (i, member) in members.iter().enumerate() {
            for neighbor in graph.neighbors(member) {
                if let Some(&j) = index_of.get(neighbor) {
                    adjacency[i][j] = 1.0;
                    degree[i] += 1.0;
                }
            }
        }

        // Shifted operator 2I - L_norm so the Fiedler direction dominates
        // once the trivial all-ones direction is projected out.
        let apply = |v: &[f64]| -> Vec<f64> {
            (0..n)
                .map(|i| {
                    let mut sum = if degree[i] > 0.0 { v[i] } else { 2.0 * v[i] };
                    for j in 0..n {
                        if adjacency[i][j] > 0.0 {
                            sum += v[j] / (degree[i] * degree[j]).sqrt();
                        }
                    }
                    sum
                })
                .collect()
        };

        let mut rng = StdRng::seed_from_u64(SPECTRAL_SEED ^ n as u64);
        let mut vector: Vec<f64> = (0..n).map(|_| rng.gen::<f64>() - 0.5).collect();

        for _ in 0..SPECTRAL_ITERATIONS {
            let mut next = apply(&vector);

            let mean = next.iter().sum::<f64>() / n as f64;
            for value in next.iter_mut() {
                *value -= mean;
            }

            let norm = next.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm < 1e-12 {
                break;
            }
            for value in next.iter_mut() {
                *value /= norm;
            }
            vector = next;
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            vector[a]
                .partial_cmp(&vector[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        chunk(order.into_iter().map(|i| members[i].clone()).collect(), max)
    }

    /// Pre-allocate each shared resource's supply across groups
    /// proportional to total ideal demand; the remainder lands on the last
    /// sharing group by id.
    fn partition_shared_supply(
        &self,
        groups: &mut [ContentionGroup],
        agents: &BTreeMap<String, Agent>,
        pool: &PoolSnapshot,
    ) {
        for resource in ResourceType::ALL {
            let sharing: Vec<usize> = groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.resources.contains(&resource))
                .map(|(i, _)| i)
                .collect();
            if sharing.len() < 2 {
                continue;
            }

            let available = pool.available(resource);
            let demands: Vec<u64> = sharing
                .iter()
                .map(|&i| {
                    groups[i]
                        .agent_ids
                        .iter()
                        .filter_map(|id| agents.get(id))
                        .map(|a| a.ideal(resource))
                        .sum()
                })
                .collect();
            let total_demand: u64 = demands.iter().sum();
            if total_demand == 0 {
                for &i in &sharing {
                    groups[i].available.set(resource, 0);
                }
                continue;
            }

            let mut assigned = 0u64;
            for (slot, &i) in sharing.iter().enumerate() {
                let share = if slot + 1 == sharing.len() {
                    available - assigned
                } else {
                    let share =
                        (available as u128 * demands[slot] as u128 / total_demand as u128) as u64;
                    assigned += share;
                    share
                };
                groups[i].available.set(resource, share);
            }
        }
    }
}

fn chunk(members: Vec<String>, max: usize) -> Vec<Vec<String>> {
    members
        .chunks(max)
        .map(|window| window.to_vec())
        .collect()
}
