//! Hop-bounded k-shortest loopless paths with a dissimilarity constraint.
//!
//! Yen-style enumeration with a uniform-cost oracle. The oracle explores
//! loopless paths only, bounds the edge count (hop threshold + 1), and
//! orders equal-cost paths lexicographically by node sequence, so ties are
//! deterministic. Accepted paths must not share more than `theta` interior
//! vertices with any previously accepted path.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// A routing demand between two node indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub source: usize,
    pub destination: usize,
}

/// A loopless path and its total latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub nodes: Vec<usize>,
    pub latency: i64,
}

/// Compute up to `k` shortest paths for `flow` over an adjacency matrix
/// (`-1` = absent edge).
///
/// - paths use at most `hop_threshold` interior vertices,
/// - any two returned paths share at most `theta` interior vertices,
/// - results are ordered by (latency, node sequence).
pub fn k_shortest(
    links: &[Vec<i64>],
    flow: Flow,
    k: usize,
    hop_threshold: usize,
    theta: usize,
) -> Vec<Path> {
    if k == 0 || flow.source == flow.destination || flow.source >= links.len() {
        return Vec::new();
    }
    let max_edges = hop_threshold + 1;

    let Some(first) = shortest_path(
        links,
        flow.source,
        flow.destination,
        max_edges,
        &HashSet::new(),
        &HashSet::new(),
    ) else {
        return Vec::new();
    };

    let mut accepted = vec![first];
    // Ordered candidate pool; (latency, nodes) gives deterministic pops.
    let mut candidates: BTreeSet<(i64, Vec<usize>)> = BTreeSet::new();

    while accepted.len() < k {
        let prev = accepted.last().expect("accepted is non-empty").clone();

        for i in 0..prev.nodes.len() - 1 {
            let spur_node = prev.nodes[i];
            let root = &prev.nodes[..=i];

            // Edges leaving the spur node that would recreate an already
            // accepted path sharing this root.
            let mut banned_edges: HashSet<(usize, usize)> = HashSet::new();
            for p in &accepted {
                if p.nodes.len() > i + 1 && p.nodes[..=i] == *root {
                    banned_edges.insert((p.nodes[i], p.nodes[i + 1]));
                }
            }
            // Root vertices (minus the spur node) must not reappear.
            let banned_nodes: HashSet<usize> = root[..i].iter().copied().collect();

            let Some(spur) = shortest_path(
                links,
                spur_node,
                flow.destination,
                max_edges - i,
                &banned_nodes,
                &banned_edges,
            ) else {
                continue;
            };

            let mut nodes = root[..i].to_vec();
            nodes.extend(&spur.nodes);
            let latency = path_cost(links, &nodes).expect("spur path uses valid edges");
            candidates.insert((latency, nodes));
        }

        // Accept the best candidate that keeps the set dissimilar enough.
        let mut chosen = None;
        while let Some((latency, nodes)) = candidates.pop_first() {
            let path = Path { nodes, latency };
            if accepted.contains(&path) {
                continue;
            }
            if dissimilar(&path, &accepted, theta) {
                chosen = Some(path);
                break;
            }
            // A too-similar candidate stays rejected; Yen will keep
            // producing spurs from the accepted set.
        }
        match chosen {
            Some(path) => accepted.push(path),
            None => break,
        }
    }

    accepted
}

/// Whether `path` shares at most `theta` interior vertices with every
/// accepted path.
pub fn dissimilar(path: &Path, accepted: &[Path], theta: usize) -> bool {
    let interior: HashSet<usize> = interior_nodes(path).collect();
    for other in accepted {
        let shared = interior_nodes(other)
            .filter(|n| interior.contains(n))
            .count();
        if shared > theta {
            return false;
        }
    }
    true
}

fn interior_nodes(path: &Path) -> impl Iterator<Item = usize> + '_ {
    let len = path.nodes.len();
    path.nodes
        .iter()
        .copied()
        .skip(1)
        .take(len.saturating_sub(2))
}

/// Total latency of a node sequence, `None` when an edge is missing.
pub fn path_cost(links: &[Vec<i64>], nodes: &[usize]) -> Option<i64> {
    let mut total = 0;
    for pair in nodes.windows(2) {
        let w = links[pair[0]][pair[1]];
        if w < 0 {
            return None;
        }
        total += w;
    }
    Some(total)
}

/// Uniform-cost search for the shortest loopless path within an edge budget.
///
/// States are ordered by (cost, node sequence), so the first time the
/// destination pops, the result is the lexicographically smallest among
/// minimum-cost paths.
fn shortest_path(
    links: &[Vec<i64>],
    source: usize,
    destination: usize,
    max_edges: usize,
    banned_nodes: &HashSet<usize>,
    banned_edges: &HashSet<(usize, usize)>,
) -> Option<Path> {
    if max_edges == 0 || banned_nodes.contains(&source) {
        return None;
    }

    let mut heap: BinaryHeap<Reverse<(i64, Vec<usize>)>> = BinaryHeap::new();
    heap.push(Reverse((0, vec![source])));
    // Best known cost per (node, edges used); equal-cost revisits are
    // pruned because the lexicographically better prefix pops first.
    let mut best: HashMap<(usize, usize), i64> = HashMap::new();

    while let Some(Reverse((cost, nodes))) = heap.pop() {
        let node = *nodes.last().expect("path is non-empty");
        if node == destination {
            return Some(Path {
                nodes,
                latency: cost,
            });
        }
        let edges_used = nodes.len() - 1;
        if edges_used >= max_edges {
            continue;
        }

        for (next, &weight) in links[node].iter().enumerate() {
            if weight < 0 || next == node {
                continue;
            }
            if banned_nodes.contains(&next) || nodes.contains(&next) {
                continue;
            }
            if banned_edges.contains(&(node, next)) {
                continue;
            }
            let next_cost = cost + weight;
            let key = (next, edges_used + 1);
            if best.get(&key).is_some_and(|&c| c <= next_cost) {
                continue;
            }
            best.insert(key, next_cost);
            let mut next_nodes = nodes.clone();
            next_nodes.push(next);
            heap.push(Reverse((next_cost, next_nodes)));
        }
    }
    None
}
