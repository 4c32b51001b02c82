//! The BPR allocation algorithm.
//!
//! 1. Seed every node with its proportional share of the increment (the
//!    last node absorbs rounding, so the total matches exactly).
//! 2. Compute each node's drift-plus-penalty value.
//! 3. Repeatedly take the worst (max-DPP) node, pull a proportion of its
//!    allocation, and redistribute it over the remaining active nodes by
//!    free CPU capacity. Keep the move only if the global DPP sum strictly
//!    improves; otherwise roll back and deactivate that node.
//! 4. Update every node's virtual-queue backlog from its predicted CPU.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{cpu_model, stability_weight, CPU_TARGET, PENALTY_V};

/// Scheduler tuning, parameterized at construction.
#[derive(Debug, Clone, Copy)]
pub struct BprParams {
    /// Bound on redistribution rounds.
    pub max_iterations: usize,
    /// Time-average CPU target enforced by the virtual queues.
    pub cpu_target: f64,
    /// Penalty multiplier V.
    pub penalty_v: f64,
    /// Whether `onset_req` seeds from the live request rate instead of zero.
    pub onset_from_live_rate: bool,
}

impl Default for BprParams {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            cpu_target: CPU_TARGET,
            penalty_v: PENALTY_V,
            onset_from_live_rate: false,
        }
    }
}

/// Working state for one backend during a scheduler run.
#[derive(Debug, Clone)]
pub struct BprNode {
    pub id: usize,
    pub ip: String,
    /// Allocation being built (requests this slot).
    pub req_rate: i64,
    /// Request rate at slot onset.
    pub onset_req: i64,
    /// Measured CPU at slot onset; fixed for the whole run.
    pub onset_cpu: f64,
    /// Predicted CPU under the current allocation.
    pub cpu_usage: f64,
    /// Persistent virtual-queue backlog.
    pub queue_backlog: f64,
    /// Measured delay towards this backend (ms).
    pub delay: f64,
    pub core_count: u32,
    /// Drift-plus-penalty value under the current allocation.
    pub dpp_value: f64,
}

impl BprNode {
    pub fn new(
        id: usize,
        ip: String,
        onset_req: i64,
        onset_cpu: f64,
        queue_backlog: f64,
        delay: f64,
        core_count: u32,
    ) -> Self {
        Self {
            id,
            ip,
            req_rate: onset_req,
            onset_req,
            onset_cpu,
            cpu_usage: onset_cpu,
            queue_backlog,
            delay,
            core_count,
            dpp_value: 0.0,
        }
    }
}

/// Run the allocation; returns the IP → request-rate map. Node state is
/// left updated (including the new queue backlogs) for persistence.
pub fn run_bpr(
    nodes: &mut [BprNode],
    total_increment: i64,
    redistribution_proportion: f64,
    params: &BprParams,
) -> HashMap<String, i64> {
    if nodes.is_empty() {
        return HashMap::new();
    }

    allocate_proportionally(nodes, total_increment);
    compute_dpp(nodes, params);

    let mut deactivated = vec![false; nodes.len()];
    for round in 0..params.max_iterations {
        let Some(worst) = max_dpp_node(nodes, &deactivated) else {
            break;
        };
        let pool = (nodes[worst].req_rate as f64 * redistribution_proportion).floor() as i64;

        let eligible: Vec<usize> = (0..nodes.len())
            .filter(|&i| i != worst && !deactivated[i])
            .collect();
        if eligible.is_empty() || pool <= 0 {
            deactivated[worst] = true;
            if deactivated.iter().all(|&d| d) {
                break;
            }
            continue;
        }

        let snapshot: Vec<i64> = nodes.iter().map(|n| n.req_rate).collect();
        let sum_before = dpp_sum(nodes);

        nodes[worst].req_rate -= pool;
        redistribute(nodes, &eligible, pool);
        compute_dpp(nodes, params);
        let sum_after = dpp_sum(nodes);

        if sum_after < sum_before {
            debug!(
                round,
                worst = nodes[worst].id,
                pool,
                sum_before,
                sum_after,
                "redistribution kept"
            );
        } else {
            for (node, &rate) in nodes.iter_mut().zip(&snapshot) {
                node.req_rate = rate;
            }
            deactivated[worst] = true;
            compute_dpp(nodes, params);
            debug!(round, worst = nodes[worst].id, "no improvement, rolled back");
            if deactivated.iter().all(|&d| d) {
                break;
            }
        }
    }

    // Virtual-queue update from the final predicted CPU.
    for node in nodes.iter_mut() {
        node.queue_backlog = (node.queue_backlog + node.cpu_usage - params.cpu_target).max(0.0);
    }

    nodes
        .iter()
        .map(|n| (n.ip.clone(), n.req_rate))
        .collect()
}

/// Seed allocations proportionally to onset rates; the last node absorbs
/// the rounding remainder so the total matches the increment exactly.
fn allocate_proportionally(nodes: &mut [BprNode], total_increment: i64) {
    let total_onset: i64 = nodes.iter().map(|n| n.onset_req).sum();
    let mut remaining = total_increment;
    let last = nodes.len() - 1;

    for i in 0..nodes.len() {
        let increment = if i == last {
            remaining
        } else if total_onset > 0 {
            let share = nodes[i].onset_req as f64 / total_onset as f64;
            let inc = (share * total_increment as f64).round() as i64;
            remaining -= inc;
            inc
        } else {
            // Zero-onset seeding: spread evenly.
            let inc = total_increment / nodes.len() as i64;
            remaining -= inc;
            inc
        };
        nodes[i].req_rate = nodes[i].onset_req + increment;
    }
}

/// Recompute predicted CPU and drift-plus-penalty for every node under the
/// current allocation.
fn compute_dpp(nodes: &mut [BprNode], params: &BprParams) {
    for node in nodes.iter_mut() {
        let model = cpu_model(node.core_count, node.onset_cpu);
        let delta_cpu = model.predict(node.req_rate) - node.onset_cpu;
        node.cpu_usage = node.onset_cpu + delta_cpu;

        let stability =
            stability_weight(node.core_count) * node.queue_backlog * delta_cpu;
        let penalty = params.penalty_v * node.delay * (node.req_rate - node.onset_req) as f64;
        node.dpp_value = stability + penalty;
    }
}

fn dpp_sum(nodes: &[BprNode]) -> f64 {
    nodes.iter().map(|n| n.dpp_value).sum()
}

fn max_dpp_node(nodes: &[BprNode], deactivated: &[bool]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, node) in nodes.iter().enumerate() {
        if deactivated[i] {
            continue;
        }
        match best {
            Some(b) if nodes[b].dpp_value >= node.dpp_value => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Spread `pool` over the eligible nodes proportionally to free CPU
/// capacity; the last eligible node absorbs the remainder, leftovers go to
/// the first.
fn redistribute(nodes: &mut [BprNode], eligible: &[usize], pool: i64) {
    let total_coef: f64 = eligible
        .iter()
        .map(|&i| (100.0 - nodes[i].cpu_usage) * nodes[i].core_count as f64)
        .sum();
    if total_coef <= 0.0 {
        // No free capacity anywhere; hand everything to the first eligible.
        nodes[eligible[0]].req_rate += pool;
        return;
    }

    let mut remaining = pool;
    let last = eligible.len() - 1;
    for (pos, &i) in eligible.iter().enumerate() {
        let share = if pos == last {
            remaining
        } else {
            let coef = (100.0 - nodes[i].cpu_usage) * nodes[i].core_count as f64;
            ((coef / total_coef) * pool as f64).floor() as i64
        };
        nodes[i].req_rate += share;
        remaining -= share;
    }
    if remaining > 0 {
        nodes[eligible[0]].req_rate += remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_nodes(count: usize, onset_req: i64, onset_cpu: f64, delay: f64) -> Vec<BprNode> {
        (0..count)
            .map(|i| {
                BprNode::new(
                    i,
                    format!("10.0.0.{}", i + 1),
                    onset_req,
                    onset_cpu,
                    0.0,
                    delay,
                    1,
                )
            })
            .collect()
    }

    #[test]
    fn conservation_with_uniform_nodes() {
        // Reference scenario: three 1-core nodes, onset 10 each, Δ=30, ρ=0.5.
        let mut nodes = uniform_nodes(3, 10, 20.0, 50.0);
        let allocation = run_bpr(&mut nodes, 30, 0.5, &BprParams::default());

        let total: i64 = allocation.values().sum();
        assert_eq!(total, 60, "Δ + Σonset must be conserved");
        for (_, &rate) in &allocation {
            assert!((rate - 20).abs() <= 1, "uniform inputs allocate uniformly");
        }
        // Queue update: max(0, 0 + cpu' − target); predicted CPU is far
        // below target, so backlogs stay at zero.
        for node in &nodes {
            assert_eq!(node.queue_backlog, 0.0);
        }
    }

    #[test]
    fn zero_onset_spreads_increment() {
        let mut nodes = uniform_nodes(3, 0, 20.0, 50.0);
        let allocation = run_bpr(&mut nodes, 30, 0.5, &BprParams::default());
        let total: i64 = allocation.values().sum();
        assert_eq!(total, 30);
        for (_, &rate) in &allocation {
            assert!(rate >= 0);
        }
    }

    #[test]
    fn slow_node_sheds_load() {
        // Same CPU everywhere, one node 10× the delay: its penalty term
        // dominates and redistribution moves load off it.
        let mut nodes = vec![
            BprNode::new(0, "10.0.0.1".to_string(), 10, 20.0, 0.0, 500.0, 1),
            BprNode::new(1, "10.0.0.2".to_string(), 10, 20.0, 0.0, 50.0, 1),
            BprNode::new(2, "10.0.0.3".to_string(), 10, 20.0, 0.0, 50.0, 1),
        ];
        let allocation = run_bpr(&mut nodes, 30, 0.5, &BprParams::default());

        let slow = allocation["10.0.0.1"];
        let fast = allocation["10.0.0.2"].min(allocation["10.0.0.3"]);
        assert!(slow < fast, "slow node {slow} should hold less than {fast}");
        assert_eq!(allocation.values().sum::<i64>(), 60);
    }

    #[test]
    fn backlogged_node_sheds_load() {
        // A large persistent backlog prices any CPU growth on node 0.
        let mut nodes = vec![
            BprNode::new(0, "10.0.0.1".to_string(), 10, 50.0, 400.0, 50.0, 1),
            BprNode::new(1, "10.0.0.2".to_string(), 10, 20.0, 0.0, 50.0, 1),
        ];
        let allocation = run_bpr(&mut nodes, 20, 0.5, &BprParams::default());
        assert_eq!(allocation.values().sum::<i64>(), 40);
        assert!(allocation["10.0.0.1"] <= allocation["10.0.0.2"]);
    }

    #[test]
    fn backlog_grows_past_target_and_never_goes_negative() {
        let mut hot = vec![BprNode::new(
            0,
            "10.0.0.1".to_string(),
            3000,
            70.0,
            5.0,
            50.0,
            1,
        )];
        run_bpr(&mut hot, 0, 0.5, &BprParams::default());
        // Predicted CPU ≈ (3000 − 107.5)/35.08 ≈ 82 > target 40.
        assert!(hot[0].queue_backlog > 5.0);

        let mut idle = vec![BprNode::new(
            0,
            "10.0.0.1".to_string(),
            10,
            20.0,
            0.5,
            50.0,
            1,
        )];
        run_bpr(&mut idle, 0, 0.5, &BprParams::default());
        assert!(idle[0].queue_backlog >= 0.0);
    }

    #[test]
    fn empty_node_set_returns_empty() {
        let mut nodes: Vec<BprNode> = Vec::new();
        assert!(run_bpr(&mut nodes, 30, 0.5, &BprParams::default()).is_empty());
    }

    #[test]
    fn single_node_takes_everything() {
        let mut nodes = uniform_nodes(1, 5, 20.0, 50.0);
        let allocation = run_bpr(&mut nodes, 17, 0.5, &BprParams::default());
        assert_eq!(allocation["10.0.0.1"], 22);
    }

    #[test]
    fn proportional_seeding_follows_onset_rates() {
        let mut nodes = vec![
            BprNode::new(0, "a".to_string(), 30, 20.0, 0.0, 50.0, 1),
            BprNode::new(1, "b".to_string(), 10, 20.0, 0.0, 50.0, 1),
        ];
        allocate_proportionally(&mut nodes, 40);
        // 3:1 split of 40 → +30 / +10.
        assert_eq!(nodes[0].req_rate, 60);
        assert_eq!(nodes[1].req_rate, 20);
    }
}
