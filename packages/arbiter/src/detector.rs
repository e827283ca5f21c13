//! FairShare-Arbiter: Contention Detection
//!
//! Builds the contention graph (an edge between every pair of competitors
//! on an oversubscribed resource) and extracts its connected components
//! with union-find. Components of size >= 2 become contention groups;
//! singletons are trivially satisfiable and stay with the caller.

use std::collections::{BTreeMap, BTreeSet};

use fairshare_core::{Agent, Contention, ContentionGroup, PoolSnapshot, ResourceType};

/// Union-find with path compression. Component sizes here are small
/// enough that plain parent assignment on union suffices.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Undirected contention graph over agent ids.
#[derive(Debug, Clone, Default)]
pub struct ContentionGraph {
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl ContentionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Number of contention edges incident to an agent.
    pub fn degree(&self, id: &str) -> usize {
        self.adjacency.get(id).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.adjacency
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }

    /// BFS hop distances from one agent to every reachable agent.
    pub fn distances_from(&self, start: &str) -> BTreeMap<String, usize> {
        let mut distances = BTreeMap::new();
        distances.insert(start.to_string(), 0usize);
        let mut frontier = std::collections::VecDeque::new();
        frontier.push_back(start.to_string());

        while let Some(current) = frontier.pop_front() {
            let depth = distances[&current];
            for neighbor in self.neighbors(&current) {
                if !distances.contains_key(neighbor) {
                    distances.insert(neighbor.to_string(), depth + 1);
                    frontier.push_back(neighbor.to_string());
                }
            }
        }

        distances
    }
}

/// Everything the detector learned about one cycle's demands.
#[derive(Debug, Clone)]
pub struct ContentionAnalysis {
    /// Connected components of size >= 2, in order of first appearance
    pub groups: Vec<ContentionGroup>,
    /// The full contention graph, for the splitter
    pub graph: ContentionGraph,
    /// Per-resource views of the oversubscribed resources
    pub contentions: Vec<Contention>,
    /// Agents in no group; the caller satisfies them directly
    pub singletons: Vec<String>,
}

/// Builds contention groups from current demands and the pool snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentionDetector;

impl ContentionDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, agents: &[&Agent], pool: &PoolSnapshot) -> ContentionAnalysis {
        let index_of: BTreeMap<&str, usize> = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.as_str(), i))
            .collect();

        let mut union_find = UnionFind::new(agents.len());
        let mut graph = ContentionGraph::new();
        let mut contentions = Vec::new();
        let mut contested = BTreeSet::new();

        for resource in ResourceType::ALL {
            let competitors: Vec<&&Agent> =
                agents.iter().filter(|a| a.demands(resource)).collect();
            let total_demand: u64 = competitors.iter().map(|a| a.ideal(resource)).sum();
            if total_demand == 0 {
                continue;
            }

            let available = pool.available(resource);
            if total_demand > available && competitors.len() >= 2 {
                contested.insert(resource);
                contentions.push(Contention {
                    resource,
                    agent_ids: competitors.iter().map(|a| a.id.clone()).collect(),
                    supply: available,
                });

                for (i, first) in competitors.iter().enumerate() {
                    for second in competitors.iter().skip(i + 1) {
                        graph.add_edge(&first.id, &second.id);
                        union_find.union(index_of[first.id.as_str()], index_of[second.id.as_str()]);
                    }
                }
            }
        }

        // Components in order of first member appearance.
        let mut members_by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut root_order: Vec<usize> = Vec::new();
        for i in 0..agents.len() {
            let root = union_find.find(i);
            let entry = members_by_root.entry(root).or_default();
            if entry.is_empty() {
                root_order.push(root);
            }
            entry.push(i);
        }

        let mut groups = Vec::new();
        let mut grouped: BTreeSet<usize> = BTreeSet::new();
        for root in root_order {
            let members = &members_by_root[&root];
            if members.len() < 2 {
                continue;
            }
            let touches_contested = members
                .iter()
                .any(|&i| agents[i].demanded_resources().any(|r| contested.contains(&r)));
            if !touches_contested {
                continue;
            }

            let mut group = ContentionGroup::new(
                groups.len() as u32,
                members.iter().map(|&i| agents[i].id.clone()).collect(),
            );
            for &i in members {
                group.resources.extend(agents[i].demanded_resources());
            }
            group.available = pool.restricted_to(group.resources.iter());
            grouped.extend(members.iter().copied());
            groups.push(group);
        }

        let singletons = (0..agents.len())
            .filter(|i| !grouped.contains(i))
            .map(|i| agents[i].id.clone())
            .collect();

        ContentionAnalysis {
            groups,
            graph,
            contentions,
            singletons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairshare_core::{ResourceBundle, ResourcePool};

    const C: ResourceType = ResourceType::Compute;
    const M: ResourceType = ResourceType::Memory;
    const S: ResourceType = ResourceType::Storage;

    fn pool(pairs: &[(ResourceType, u64)]) -> ResourcePool {
        ResourcePool::new(pairs.iter().copied().collect::<ResourceBundle>())
    }

    fn agent(id: &str, demands: &[(ResourceType, u64, u64)]) -> Agent {
        let mut agent = Agent::new(id, id.to_uppercase());
        for &(resource, minimum, ideal) in demands {
            agent = agent.with_demand(resource, minimum, ideal);
        }
        agent
    }

    #[test]
    fn test_oversubscription_creates_a_group() {
        let a = agent("a", &[(C, 10, 80)]);
        let b = agent("b", &[(C, 10, 70)]);
        let pool = pool(&[(C, 100)]);

        let analysis =
            ContentionDetector::new().detect(&[&a, &b], &pool.snapshot());

        assert_eq!(analysis.groups.len(), 1);
        assert_eq!(analysis.groups[0].agent_ids, vec!["a", "b"]);
        assert_eq!(analysis.contentions.len(), 1);
        assert_eq!(analysis.contentions[0].supply, 100);
        assert!(analysis.singletons.is_empty());
    }

    #[test]
    fn test_adequate_supply_means_no_groups() {
        let a = agent("a", &[(C, 10, 40)]);
        let b = agent("b", &[(C, 10, 40)]);
        let pool = pool(&[(C, 100)]);

        let analysis =
            ContentionDetector::new().detect(&[&a, &b], &pool.snapshot());

        assert!(analysis.groups.is_empty());
        assert_eq!(analysis.singletons, vec!["a", "b"]);
    }

    #[test]
    fn test_single_competitor_is_never_contended() {
        // Demand above supply, but alone: handled trivially by the caller.
        let a = agent("a", &[(C, 10, 200)]);
        let pool = pool(&[(C, 100)]);

        let analysis = ContentionDetector::new().detect(&[&a], &pool.snapshot());
        assert!(analysis.groups.is_empty());
        assert_eq!(analysis.singletons, vec!["a"]);
    }

    #[test]
    fn test_chain_merges_into_one_component() {
        // a-b contend on compute, b-c on memory: one component of three.
        let a = agent("a", &[(C, 0, 80)]);
        let b = agent("b", &[(C, 0, 80), (M, 0, 60)]);
        let c = agent("c", &[(M, 0, 60)]);
        let pool = pool(&[(C, 100), (M, 100)]);

        let analysis =
            ContentionDetector::new().detect(&[&a, &b, &c], &pool.snapshot());

        assert_eq!(analysis.groups.len(), 1);
        assert_eq!(analysis.groups[0].agent_ids, vec!["a", "b", "c"]);
        assert!(analysis.graph.has_edge("a", "b"));
        assert!(analysis.graph.has_edge("b", "c"));
        assert!(!analysis.graph.has_edge("a", "c"));
    }

    #[test]
    fn test_group_carries_all_member_resources_and_supply() {
        let a = agent("a", &[(C, 0, 80), (S, 0, 10)]);
        let b = agent("b", &[(C, 0, 80)]);
        let pool = pool(&[(C, 100), (S, 500)]);

        let analysis =
            ContentionDetector::new().detect(&[&a, &b], &pool.snapshot());

        let group = &analysis.groups[0];
        // Storage is not contested but a member wants it
        assert!(group.resources.contains(&S));
        assert_eq!(group.available.get(C), 100);
        assert_eq!(group.available.get(S), 500);
    }

    #[test]
    fn test_independent_conflicts_stay_separate() {
        let a = agent("a", &[(C, 0, 80)]);
        let b = agent("b", &[(C, 0, 80)]);
        let c = agent("c", &[(M, 0, 80)]);
        let d = agent("d", &[(M, 0, 80)]);
        let pool = pool(&[(C, 100), (M, 100)]);

        let analysis =
            ContentionDetector::new().detect(&[&a, &b, &c, &d], &pool.snapshot());

        assert_eq!(analysis.groups.len(), 2);
        assert_eq!(analysis.groups[0].agent_ids, vec!["a", "b"]);
        assert_eq!(analysis.groups[1].agent_ids, vec!["c", "d"]);
        assert_eq!(analysis.groups[0].id, 0);
        assert_eq!(analysis.groups[1].id, 1);
    }

    #[test]
    fn test_bfs_distances() {
        let mut graph = ContentionGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "d");

        let distances = graph.distances_from("a");
        assert_eq!(distances["a"], 0);
        assert_eq!(distances["b"], 1);
        assert_eq!(distances["c"], 2);
        assert_eq!(distances["d"], 3);
        assert!(!distances.contains_key("e"));
    }

    #[test]
    fn test_union_find_components() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 4);
        assert!(uf.connected(0, 1));
        assert!(!uf.connected(1, 2));
        assert!(uf.connected(3, 4));
    }
}
