//! Cost pre-flight DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::step::StepType;

/// Cost of all steps of one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLine {
    pub unit_count: u64,
    pub unit_price: f64,
    pub total: f64,
}

/// Estimated cost of a bulk request before it is submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub per_step_type: BTreeMap<StepType, CostLine>,
    pub grand_total: f64,
}

impl CostEstimate {
    /// Builds an estimate from per-type counts and unit prices
    pub fn from_lines(lines: impl IntoIterator<Item = (StepType, u64, f64)>) -> Self {
        let mut per_step_type = BTreeMap::new();
        let mut grand_total = 0.0;

        for (step_type, unit_count, unit_price) in lines {
            let total = unit_count as f64 * unit_price;
            grand_total += total;
            per_step_type.insert(
                step_type,
                CostLine {
                    unit_count,
                    unit_price,
                    total,
                },
            );
        }

        Self {
            per_step_type,
            grand_total,
        }
    }

    pub fn unit_count(&self) -> u64 {
        self.per_step_type.values().map(|l| l.unit_count).sum()
    }
}
