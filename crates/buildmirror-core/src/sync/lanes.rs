//! Pending build-id sets for proactive fat loading.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

/// Fixed number of independently drained id sets.
#[derive(Debug)]
pub struct ProactiveLanes {
    lanes: Vec<Mutex<HashSet<u32>>>,
}

impl ProactiveLanes {
    /// `count` is clamped to at least one lane.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            lanes: (0..count.max(1)).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.lanes.len()
    }

    /// Pseudo-random lane index.
    #[must_use]
    pub fn pick(&self) -> usize {
        rand::thread_rng().gen_range(0..self.lanes.len())
    }

    /// Merge `ids` into `lane`.
    pub fn add(&self, lane: usize, ids: impl IntoIterator<Item = u32>) {
        if let Some(set) = self.lanes.get(lane) {
            set.lock().unwrap_or_else(PoisonError::into_inner).extend(ids);
        }
    }

    /// Swap the lane's set for an empty one and return what it held.
    #[must_use]
    pub fn take(&self, lane: usize) -> HashSet<u32> {
        self.lanes.get(lane).map_or_else(HashSet::new, |set| {
            std::mem::take(&mut *set.lock().unwrap_or_else(PoisonError::into_inner))
        })
    }

    /// Ids waiting across all lanes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lanes
            .iter()
            .map(|set| set.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}
