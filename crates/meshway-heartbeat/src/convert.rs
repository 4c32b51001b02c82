//! Conversions between wire types and domain types.

use crate::proto;
use meshway_assess::{IpPairAssessment, RegionPairAssessment};
use meshway_state::NodeMetrics;

impl From<&proto::Metrics> for NodeMetrics {
    fn from(m: &proto::Metrics) -> Self {
        NodeMetrics {
            ip: m.ip.clone(),
            cpu_usage: m.cpu_usage,
            cpu_cores: m.cpu_cores,
            memory_usage: m.memory_usage,
            collected_at: m.collected_at.max(0) as u64,
        }
    }
}

impl From<&RegionPairAssessment> for proto::RegionPairAssessment {
    fn from(a: &RegionPairAssessment) -> Self {
        proto::RegionPairAssessment {
            region1: a.region1.clone(),
            region2: a.region2.clone(),
            ip_pairs: a
                .ip_pairs
                .iter()
                .map(|p| proto::IpPairAssessment {
                    ip1: p.ip1.clone(),
                    ip2: p.ip2.clone(),
                    assessment: p.assessment,
                })
                .collect(),
        }
    }
}

impl From<&proto::RegionPairAssessment> for RegionPairAssessment {
    fn from(a: &proto::RegionPairAssessment) -> Self {
        RegionPairAssessment {
            region1: a.region1.clone(),
            region2: a.region2.clone(),
            ip_pairs: a
                .ip_pairs
                .iter()
                .map(|p| IpPairAssessment {
                    ip1: p.ip1.clone(),
                    ip2: p.ip2.clone(),
                    assessment: p.assessment,
                })
                .collect(),
        }
    }
}
