//! Shared cache of the latest per-domain allocations.
//!
//! Written by the scheduler ticker, read by the dynamic route publisher
//! and the inspection API. Readers always receive copies.

use std::collections::HashMap;
use std::sync::RwLock;

/// IP → allocated request rate.
pub type Allocation = HashMap<String, i64>;

/// Latest BPR result per domain behind a read-write lock.
#[derive(Default)]
pub struct BprResultCache {
    results: RwLock<HashMap<String, Allocation>>,
}

impl BprResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached allocation for a domain.
    pub fn set(&self, domain: &str, allocation: Allocation) {
        self.results
            .write()
            .expect("bpr cache lock poisoned")
            .insert(domain.to_string(), allocation);
    }

    /// Copy of the cached allocation for a domain.
    pub fn get(&self, domain: &str) -> Option<Allocation> {
        self.results
            .read()
            .expect("bpr cache lock poisoned")
            .get(domain)
            .cloned()
    }

    /// Copy of every cached allocation.
    pub fn all(&self) -> HashMap<String, Allocation> {
        self.results
            .read()
            .expect("bpr cache lock poisoned")
            .clone()
    }
}
