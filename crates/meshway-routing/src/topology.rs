//! Directed weighted topology keyed by IP.
//!
//! Built from region-pair assessments: every (source region IP × target
//! region IP) combination receives the pair's default weight unless an
//! outlier override names it explicitly. Locally measured probe delays can
//! then be overlaid and replace the assessment-derived edge.

use std::collections::HashMap;

use meshway_assess::RegionPairAssessment;
use tracing::debug;

/// Adjacency-matrix topology; `-1` marks an absent edge.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    ip_to_index: HashMap<String, usize>,
    index_to_ip: Vec<String>,
    links: Vec<Vec<i64>>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand region assessments into IP-level edges.
    ///
    /// `nodes` supplies the region membership (ip, region). Pairs named
    /// `default`/`default` carry the region-pair default weight; any other
    /// pair is an outlier override for that exact edge. Self-loops are
    /// skipped.
    pub fn from_assessments(
        assessments: &[RegionPairAssessment],
        nodes: &[(String, String)],
    ) -> Self {
        let mut region_to_ips: HashMap<&str, Vec<&str>> = HashMap::new();
        for (ip, region) in nodes {
            region_to_ips.entry(region.as_str()).or_default().push(ip);
        }

        let mut graph = Self::new();
        for assessment in assessments {
            if assessment.region1.is_empty() || assessment.region2.is_empty() {
                continue;
            }

            let mut default_weight = None;
            let mut overrides: HashMap<(&str, &str), f64> = HashMap::new();
            for pair in &assessment.ip_pairs {
                if pair.ip1 == "default" && pair.ip2 == "default" {
                    default_weight = Some(pair.assessment);
                } else {
                    overrides.insert((pair.ip1.as_str(), pair.ip2.as_str()), pair.assessment);
                }
            }

            let (Some(sources), Some(targets)) = (
                region_to_ips.get(assessment.region1.as_str()),
                region_to_ips.get(assessment.region2.as_str()),
            ) else {
                debug!(
                    region1 = %assessment.region1,
                    region2 = %assessment.region2,
                    "assessment names a region with no known members"
                );
                continue;
            };

            for &src in sources {
                for &dst in targets {
                    if src == dst {
                        continue;
                    }
                    let weight = overrides
                        .get(&(src, dst))
                        .copied()
                        .or(default_weight);
                    if let Some(w) = weight {
                        graph.add_link(src, dst, w);
                    }
                }
            }
        }
        graph
    }

    /// Index of a known IP.
    pub fn index_of(&self, ip: &str) -> Option<usize> {
        self.ip_to_index.get(ip).copied()
    }

    /// IP at a node index.
    pub fn ip_at(&self, index: usize) -> Option<&str> {
        self.index_to_ip.get(index).map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.index_to_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_ip.is_empty()
    }

    /// Adjacency matrix view (`-1` = absent).
    pub fn links(&self) -> &[Vec<i64>] {
        &self.links
    }

    /// Weight of a directed edge, `None` when absent.
    pub fn edge(&self, src: &str, dst: &str) -> Option<i64> {
        let (s, d) = (self.index_of(src)?, self.index_of(dst)?);
        let w = self.links[s][d];
        (w >= 0).then_some(w)
    }

    /// Insert or replace a directed edge. Unknown IPs are registered.
    pub fn add_link(&mut self, src: &str, dst: &str, weight: f64) {
        if src == dst {
            return;
        }
        let s = self.intern(src);
        let d = self.intern(dst);
        self.links[s][d] = weight.round().max(0.0) as i64;
    }

    /// Overlay a locally measured delay, replacing any assessment-derived
    /// edge for the same pair.
    pub fn overlay_local_probe(&mut self, src: &str, dst: &str, delay_ms: f64) {
        self.add_link(src, dst, delay_ms);
    }

    fn intern(&mut self, ip: &str) -> usize {
        if let Some(&idx) = self.ip_to_index.get(ip) {
            return idx;
        }
        let idx = self.index_to_ip.len();
        self.ip_to_index.insert(ip.to_string(), idx);
        self.index_to_ip.push(ip.to_string());
        for row in &mut self.links {
            row.push(-1);
        }
        self.links.push(vec![-1; idx + 1]);
        idx
    }
}
