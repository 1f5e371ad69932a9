//! Combining per-model outputs into one vector.
//!
//! Only successful outputs are passed in. Every contributor must have the same
//! length; a mismatch fails the whole aggregation rather than truncating or padding.

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Unweighted elementwise arithmetic mean.
    #[default]
    Mean,
    /// Elementwise mean weighted by each descriptor's `weight`.
    WeightedMean,
}

/// One successful model output.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    pub name: &'a str,
    pub output: &'a [f32],
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub values: Vec<f32>,
    /// Elementwise population standard deviation across contributors.
    pub spread: Vec<f32>,
}

/// Check that every contribution has the same length and return it.
pub fn common_dimension(contributions: &[Contribution<'_>]) -> Result<usize> {
    let Some(first) = contributions.first() else {
        return Err(EnsembleError::AllModelsFailed { failures: Vec::new() });
    };
    let dim = first.output.len();
    if contributions.iter().any(|c| c.output.len() != dim) {
        let dims = contributions.iter().map(|c| (c.name.to_string(), c.output.len())).collect();
        return Err(EnsembleError::DimensionMismatch { dims });
    }
    Ok(dim)
}

pub fn aggregate(policy: AggregationPolicy, contributions: &[Contribution<'_>]) -> Result<Aggregate> {
    let dim = common_dimension(contributions)?;
    let weight_of = |c: &Contribution<'_>| -> f64 {
        match policy {
            AggregationPolicy::Mean => 1.0,
            AggregationPolicy::WeightedMean => c.weight as f64,
        }
    };
    let total: f64 = contributions.iter().map(weight_of).sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(EnsembleError::Config(format!("aggregate weight total {total} is not positive")));
    }

    // f64 accumulators keep the mean independent of contribution order.
    let mut mean = vec![0f64; dim];
    for c in contributions {
        let w = weight_of(c);
        for (acc, v) in mean.iter_mut().zip(c.output) {
            *acc += w * *v as f64;
        }
    }
    mean.iter_mut().for_each(|m| *m /= total);

    let mut var = vec![0f64; dim];
    for c in contributions {
        let w = weight_of(c);
        for ((acc, v), m) in var.iter_mut().zip(c.output).zip(&mean) {
            let d = *v as f64 - m;
            *acc += w * d * d;
        }
    }

    Ok(Aggregate {
        values: mean.iter().map(|m| *m as f32).collect(),
        spread: var.iter().map(|v| (v / total).sqrt() as f32).collect(),
    })
}
