use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

const WEIGHT_FLOOR_FRACTION: f64 = 0.1;

/// Per-gene quantity the detection probability is modelled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BiasCovariate {
    GeneLength,
    MeanExpression,
}

/// Weighted pool-adjacent-violators fit of a non-decreasing sequence.
pub fn isotonic_regression(values: &[f64], weights: &[f64]) -> Vec<f64> {
    // (mean, weight, count) per pooled block
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(values.len());
    for (&value, &weight) in values.iter().zip(weights) {
        blocks.push((value, weight, 1));
        while blocks.len() > 1 {
            let n = blocks.len();
            let (last_mean, last_weight, last_count) = blocks[n - 1];
            let (prev_mean, prev_weight, prev_count) = blocks[n - 2];
            if prev_mean <= last_mean {
                break;
            }
            let weight = prev_weight + last_weight;
            let mean = if weight > 0.0 {
                (prev_mean * prev_weight + last_mean * last_weight) / weight
            } else {
                (prev_mean + last_mean) / 2.0
            };
            blocks.truncate(n - 2);
            blocks.push((mean, weight, prev_count + last_count));
        }
    }

    blocks
        .into_iter()
        .flat_map(|(mean, _, count)| std::iter::repeat(mean).take(count))
        .collect()
}

/// Probability weighting function: the fitted chance of a gene being
/// labelled given its covariate.
///
/// Genes are ordered by covariate and grouped into bins of `bin_size`; the
/// label proportion per bin is made non-decreasing by weighted isotonic
/// regression and assigned back to every gene of the bin. Weights are floored
/// at a fraction of the smallest positive fit so no gene has zero weight.
/// Without any labelled gene every weight is 1.
pub fn probability_weighting(covariate: &[f64], labels: &[bool], bin_size: usize) -> Vec<f64> {
    let n = covariate.len().min(labels.len());
    if n == 0 {
        return Vec::new();
    }
    if !labels[..n].iter().any(|&l| l) {
        return vec![1.0; n];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| covariate[a].total_cmp(&covariate[b]).then(a.cmp(&b)));

    let bin_size = bin_size.max(1);
    let bins: Vec<&[usize]> = order.chunks(bin_size).collect();
    let proportions: Vec<f64> = bins
        .iter()
        .map(|bin| bin.iter().filter(|&&i| labels[i]).count() as f64 / bin.len() as f64)
        .collect();
    let bin_weights: Vec<f64> = bins.iter().map(|bin| bin.len() as f64).collect();
    let fitted = isotonic_regression(&proportions, &bin_weights);

    let min_positive = fitted
        .iter()
        .copied()
        .filter(|&f| f > 0.0)
        .fold(f64::INFINITY, f64::min);
    let floor = if min_positive.is_finite() {
        min_positive * WEIGHT_FLOOR_FRACTION
    } else {
        1.0
    };

    let mut weights = vec![0.0; n];
    for (bin, &value) in bins.iter().zip(&fitted) {
        for &i in *bin {
            weights[i] = value.max(floor);
        }
    }
    debug!(
        "Probability weighting over {} genes in {} bins (range {:.4}..{:.4})",
        n,
        bins.len(),
        fitted.first().copied().unwrap_or(0.0),
        fitted.last().copied().unwrap_or(0.0)
    );
    weights
}
