//! Endpoint selection for multi-endpoint runs.
//!
//! A selector is built once per run from the spec's endpoint list and
//! distribution strategy. Selection is O(1) per request: round-robin and
//! sequential are pure index arithmetic over a precomputed plan, weighted
//! draws uniformly from a bag expanded by weight.

use rand::Rng;

use crate::spec::{DistributionStrategy, EndpointSpec};

/// Chooses the endpoint for each request of a run.
///
/// `request_number` is 1-indexed throughout. The endpoint list must be
/// non-empty (the spec derives a synthetic "default" endpoint for
/// single-URL tests).
#[derive(Debug)]
pub struct EndpointSelector {
    endpoints: Vec<EndpointSpec>,
    plan: SelectionPlan,
}

#[derive(Debug)]
enum SelectionPlan {
    RoundRobin,
    /// Endpoint indices repeated by weight; each pick is an independent
    /// uniform draw.
    Weighted { bag: Vec<usize> },
    /// Cumulative upper bounds (inclusive, 1-indexed) of each endpoint's
    /// contiguous request range.
    Sequential { boundaries: Vec<u64> },
}

impl EndpointSelector {
    pub fn new(
        endpoints: Vec<EndpointSpec>,
        strategy: DistributionStrategy,
        total_requests: u64,
    ) -> Self {
        let plan = match strategy {
            DistributionStrategy::RoundRobin => SelectionPlan::RoundRobin,
            DistributionStrategy::Weighted => {
                let mut bag = Vec::new();
                for (index, endpoint) in endpoints.iter().enumerate() {
                    for _ in 0..endpoint.weight.max(1) {
                        bag.push(index);
                    }
                }
                SelectionPlan::Weighted { bag }
            }
            DistributionStrategy::Sequential => {
                let count = endpoints.len() as u64;
                let base = total_requests / count;
                let remainder = total_requests % count;

                // Earlier endpoints absorb the remainder, one request each.
                let mut boundaries = Vec::with_capacity(endpoints.len());
                let mut end = 0u64;
                for index in 0..count {
                    end += base + u64::from(index < remainder);
                    boundaries.push(end);
                }
                SelectionPlan::Sequential { boundaries }
            }
        };

        Self { endpoints, plan }
    }

    /// The endpoint handling the given request number.
    pub fn select(&self, request_number: u64) -> &EndpointSpec {
        let index = match &self.plan {
            SelectionPlan::RoundRobin => {
                ((request_number - 1) % self.endpoints.len() as u64) as usize
            }
            SelectionPlan::Weighted { bag } => {
                bag[rand::thread_rng().gen_range(0..bag.len())]
            }
            SelectionPlan::Sequential { boundaries } => boundaries
                .partition_point(|&end| end < request_number)
                .min(self.endpoints.len() - 1),
        };
        &self.endpoints[index]
    }

    /// Endpoint names, in spec order.
    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }
}
