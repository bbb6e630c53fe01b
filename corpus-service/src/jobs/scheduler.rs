//! Weighted round-robin over priority classes.

use std::sync::atomic::{AtomicUsize, Ordering};

use strum::IntoEnumIterator;

use crate::config::SchedulingConfig;
use crate::db::JobPriority;

/// Picks which priority a worker should try first.
///
/// Over one cycle of `sum(weights)` dispatches each priority is tried first
/// `weight` times, so a priority with queued work is served at least once per
/// cycle no matter how busy the others are.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// All priorities, best candidate first. Advances the cycle.
    pub fn preference_order(&self, weights: &SchedulingConfig) -> Vec<JobPriority> {
        let share = |priority: JobPriority| u64::from(weights.weight(priority).max(1));
        let total: u64 = JobPriority::iter().map(share).sum();

        // Walk the cumulative shares to find which priority owns this slot
        let mut slot = self.cursor.fetch_add(1, Ordering::Relaxed) as u64 % total;
        let mut first = JobPriority::Low;
        for priority in JobPriority::iter() {
            if slot < share(priority) {
                first = priority;
                break;
            }
            slot -= share(priority);
        }

        let mut order = Vec::with_capacity(3);
        order.push(first);
        order.extend(JobPriority::iter().filter(|p| *p != first));
        order
    }
}
