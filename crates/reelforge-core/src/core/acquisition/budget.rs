//! Acquisition Budget
//!
//! Cumulative target a batch is trying to reach. Satisfaction is sticky for
//! the lifetime of one run.

use serde::{Deserialize, Serialize};

/// Cumulative metric goal of one scheduling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionBudget {
    pub target: f64,
    /// Per-item cap applied to every contribution
    pub ceiling: f64,
    pub accumulated: f64,
    satisfied: bool,
}

impl AcquisitionBudget {
    /// A non-positive target is satisfied before anything runs
    pub fn new(target: f64, ceiling: f64) -> Self {
        Self {
            target,
            ceiling,
            accumulated: 0.0,
            satisfied: target <= 0.0,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    /// Capped contribution of a weight
    pub fn contribution(&self, weight: f64) -> f64 {
        weight.max(0.0).min(self.ceiling.max(0.0))
    }

    /// Adds a succeeded weight. Returns `true` if this call satisfied the budget.
    pub fn add(&mut self, weight: f64) -> bool {
        self.accumulated += self.contribution(weight);
        if !self.satisfied && self.accumulated >= self.target {
            self.satisfied = true;
            return true;
        }
        false
    }

    /// Remaining amount before satisfaction (zero once satisfied)
    pub fn remaining(&self) -> f64 {
        (self.target - self.accumulated).max(0.0)
    }
}
