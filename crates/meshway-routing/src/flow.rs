//! Residual max-flow augmentation over a chosen path set.
//!
//! The selected paths induce a capacity graph (one unit per path edge).
//! When Edmonds–Karp shows the set saturates below the requested path
//! count, the min-cut edges are opened (removed from a working copy of the
//! topology) and the k-shortest search re-runs, forcing routes around the
//! bottleneck. Rounds are bounded; the final set is the de-duplicated,
//! dissimilarity-filtered union.

use std::collections::VecDeque;

use tracing::debug;

use crate::ksp::{dissimilar, k_shortest, Flow, Path};

/// A directed edge with its residual capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub capacity: i64,
}

/// Unit-capacity flow network induced by path usage.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    capacity: Vec<Vec<i64>>,
    flow: Vec<Vec<i64>>,
    nodes: usize,
}

impl FlowGraph {
    pub fn new(nodes: usize) -> Self {
        Self {
            capacity: vec![vec![0; nodes]; nodes],
            flow: vec![vec![0; nodes]; nodes],
            nodes,
        }
    }

    /// Add one unit of capacity along every edge of a path.
    pub fn add_path(&mut self, path: &Path) {
        for pair in path.nodes.windows(2) {
            self.capacity[pair[0]][pair[1]] += 1;
        }
    }

    /// Reset flow (capacities are kept).
    pub fn clear_flow(&mut self) {
        for row in &mut self.flow {
            row.fill(0);
        }
    }

    /// Edmonds–Karp max flow from `source` to `sink`.
    pub fn max_flow(&mut self, source: usize, sink: usize) -> i64 {
        self.clear_flow();
        let mut total = 0;

        loop {
            // BFS for an augmenting path in the residual graph.
            let mut parent = vec![usize::MAX; self.nodes];
            parent[source] = source;
            let mut queue = VecDeque::from([source]);
            while let Some(u) = queue.pop_front() {
                for v in 0..self.nodes {
                    if parent[v] == usize::MAX && self.residual(u, v) > 0 {
                        parent[v] = u;
                        queue.push_back(v);
                    }
                }
            }
            if parent[sink] == usize::MAX {
                break;
            }

            // Bottleneck along the augmenting path.
            let mut bottleneck = i64::MAX;
            let mut v = sink;
            while v != source {
                let u = parent[v];
                bottleneck = bottleneck.min(self.residual(u, v));
                v = u;
            }

            let mut v = sink;
            while v != source {
                let u = parent[v];
                self.flow[u][v] += bottleneck;
                self.flow[v][u] -= bottleneck;
                v = u;
            }
            total += bottleneck;
        }
        total
    }

    /// Saturated edges crossing the source-side cut of the residual graph.
    ///
    /// Valid after [`max_flow`]; these are the bottleneck edges.
    pub fn min_cut(&self, source: usize) -> Vec<Edge> {
        let mut reachable = vec![false; self.nodes];
        reachable[source] = true;
        let mut queue = VecDeque::from([source]);
        while let Some(u) = queue.pop_front() {
            for v in 0..self.nodes {
                if !reachable[v] && self.residual(u, v) > 0 {
                    reachable[v] = true;
                    queue.push_back(v);
                }
            }
        }

        let mut cut = Vec::new();
        for u in 0..self.nodes {
            for v in 0..self.nodes {
                if reachable[u] && !reachable[v] && self.capacity[u][v] > 0 {
                    cut.push(Edge {
                        from: u,
                        to: v,
                        capacity: self.capacity[u][v],
                    });
                }
            }
        }
        cut
    }

    fn residual(&self, u: usize, v: usize) -> i64 {
        self.capacity[u][v] - self.flow[u][v]
    }
}

/// K-shortest paths with bounded min-cut augmentation.
///
/// Runs the plain search first; while the induced unit-capacity flow stays
/// below the requested count, opens the min-cut edges and searches again on
/// the relaxed topology, accumulating distinct paths.
pub fn k_shortest_augmented(
    links: &[Vec<i64>],
    flow: Flow,
    k: usize,
    hop_threshold: usize,
    theta: usize,
    max_iterations: usize,
) -> Vec<Path> {
    let mut working = links.to_vec();
    let mut all_paths: Vec<Path> = Vec::new();
    let mut paths = k_shortest(&working, flow, k, hop_threshold, theta);

    let mut iterations = 0;
    loop {
        for p in &paths {
            if !all_paths.contains(p) {
                all_paths.push(p.clone());
            }
        }
        if all_paths.len() >= k || paths.is_empty() || iterations >= max_iterations {
            break;
        }

        let mut graph = FlowGraph::new(links.len());
        for p in &paths {
            graph.add_path(p);
        }
        let max_flow = graph.max_flow(flow.source, flow.destination);
        if max_flow >= k as i64 {
            break;
        }

        let cut = graph.min_cut(flow.source);
        if cut.is_empty() {
            break;
        }
        debug!(round = iterations, edges = cut.len(), "opening min-cut edges");
        for edge in cut {
            working[edge.from][edge.to] = -1;
        }

        paths = k_shortest(&working, flow, k, hop_threshold, theta);
        iterations += 1;
    }

    // Deterministic order, then re-apply the dissimilarity constraint over
    // the cross-round union.
    all_paths.sort_by(|a, b| (a.latency, &a.nodes).cmp(&(b.latency, &b.nodes)));
    let mut selected: Vec<Path> = Vec::new();
    for p in all_paths {
        if selected.len() >= k {
            break;
        }
        if dissimilar(&p, &selected, theta) {
            selected.push(p);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_links() -> Vec<Vec<i64>> {
        vec![
            vec![0, 3, -1, 5, 7, -1],
            vec![3, 0, 2, -1, 4, -1],
            vec![-1, 2, 0, 4, -1, -1],
            vec![5, -1, 4, 0, 3, 8],
            vec![7, 4, -1, 3, 0, 6],
            vec![-1, -1, -1, 8, 6, 0],
        ]
    }

    #[test]
    fn disjoint_paths_saturate_at_path_count() {
        let mut graph = FlowGraph::new(6);
        graph.add_path(&Path {
            nodes: vec![0, 3, 5],
            latency: 13,
        });
        graph.add_path(&Path {
            nodes: vec![0, 1, 4, 5],
            latency: 13,
        });
        assert_eq!(graph.max_flow(0, 5), 2);
    }

    #[test]
    fn shared_edge_limits_flow() {
        let mut graph = FlowGraph::new(6);
        // Both paths funnel through 4→5.
        graph.add_path(&Path {
            nodes: vec![0, 4, 5],
            latency: 13,
        });
        graph.add_path(&Path {
            nodes: vec![0, 3, 4, 5],
            latency: 14,
        });
        // 4→5 has capacity 2, so both units still fit; flow is 2.
        assert_eq!(graph.max_flow(0, 5), 2);

        // A single unit on the shared tail caps the flow at 1.
        let mut graph = FlowGraph::new(6);
        graph.add_path(&Path {
            nodes: vec![0, 4, 5],
            latency: 13,
        });
        graph.capacity_override(4, 5, 1);
        graph.add_path(&Path {
            nodes: vec![0, 3, 4, 5],
            latency: 14,
        });
        graph.capacity_override(4, 5, 1);
        assert_eq!(graph.max_flow(0, 5), 1);
    }

    #[test]
    fn min_cut_names_the_bottleneck() {
        let mut graph = FlowGraph::new(4);
        // 0→1→3 and 0→2→3 merged into 1→3 bottleneck.
        graph.add_path(&Path {
            nodes: vec![0, 1, 3],
            latency: 2,
        });
        graph.add_path(&Path {
            nodes: vec![0, 2, 1, 3],
            latency: 3,
        });
        graph.capacity_override(1, 3, 1);
        let flow = graph.max_flow(0, 3);
        assert_eq!(flow, 1);

        let cut = graph.min_cut(0);
        assert!(cut.iter().any(|e| e.from == 1 && e.to == 3));
    }

    #[test]
    fn augmentation_returns_at_most_k_dissimilar_paths() {
        let links = reference_links();
        let paths = k_shortest_augmented(
            &links,
            Flow {
                source: 0,
                destination: 5,
            },
            4,
            3,
            1,
            3,
        );
        assert!(!paths.is_empty());
        assert!(paths.len() <= 4);
        for pair in paths.windows(2) {
            assert!(pair[0].latency <= pair[1].latency);
        }
    }

    #[test]
    fn augmentation_on_empty_graph_is_empty() {
        let links = vec![vec![0, -1], vec![-1, 0]];
        let paths = k_shortest_augmented(
            &links,
            Flow {
                source: 0,
                destination: 1,
            },
            2,
            3,
            1,
            3,
        );
        assert!(paths.is_empty());
    }

    impl FlowGraph {
        /// Test helper: pin a capacity entry to an exact value.
        fn capacity_override(&mut self, u: usize, v: usize, cap: i64) {
            self.capacity[u][v] = cap;
        }
    }
}
