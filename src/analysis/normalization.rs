//! Library-size and dispersion normalization of raw count input.
//!
//! Size factors follow the median-of-ratios estimator; the log2 scale comes
//! from the parametric variance-stabilizing transform of a negative binomial
//! model whose dispersion trend is `asymptotic + extra_poisson / mean`.

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::Serialize;

use crate::parsers::expression_parser::ExpressionMatrix;
use crate::utils::error::{PipelineError, Result};
use crate::utils::statistics::median;

const MIN_TREND_MEAN: f64 = 1.0;

#[derive(Debug, Clone, Serialize)]
pub struct NormalizationSummary {
    pub size_factors: Vec<f64>,
    pub asymptotic_dispersion: f64,
    pub extra_poisson: f64,
}

fn median_dispersion(points: &[(f64, f64)]) -> f64 {
    let disps: Vec<f64> = points.iter().map(|&(_, d)| d).collect();
    let mid = median(&disps);
    if mid.is_finite() { mid.max(1e-3) } else { 0.1 }
}

/// Median-of-ratios size factors over genes with all counts positive.
pub fn estimate_size_factors(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();
    if n_genes == 0 || n_samples == 0 {
        return Err(PipelineError::Normalization("count matrix is empty".to_string()));
    }
    if counts.iter().any(|&c| c < 0.0 || !c.is_finite()) {
        return Err(PipelineError::Normalization(
            "counts must be finite and non-negative".to_string(),
        ));
    }

    let log_geo_means: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|&c| c > 0.0))
        .map(|(i, row)| (i, row.iter().map(|c| c.ln()).sum::<f64>() / n_samples as f64))
        .collect();

    if log_geo_means.is_empty() {
        return Err(PipelineError::Normalization(
            "no gene has positive counts in every sample".to_string(),
        ));
    }

    let mut size_factors = Array1::zeros(n_samples);
    for j in 0..n_samples {
        let ratios: Vec<f64> = log_geo_means
            .iter()
            .map(|&(i, log_geo)| (counts[[i, j]].ln() - log_geo).exp())
            .collect();
        size_factors[j] = median(&ratios);
    }

    if size_factors.iter().any(|&s: &f64| s <= 0.0 || !s.is_finite()) {
        return Err(PipelineError::Normalization("invalid size factors".to_string()));
    }
    Ok(size_factors)
}

/// Least-squares fit of method-of-moments dispersions against `1 / mean`.
fn fit_dispersion_trend(normalized: &Array2<f64>) -> (f64, f64) {
    let n_samples = normalized.ncols();
    if n_samples < 2 {
        return (0.1, 1.0);
    }

    let points: Vec<(f64, f64)> = normalized
        .axis_iter(Axis(0))
        .filter_map(|row| {
            let mean = row.sum() / n_samples as f64;
            if mean < MIN_TREND_MEAN {
                return None;
            }
            let var = row.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n_samples - 1) as f64;
            let disp = (var - mean) / (mean * mean);
            (disp.is_finite() && disp > 0.0).then_some((1.0 / mean, disp))
        })
        .collect();

    if points.len() < 3 {
        return (median_dispersion(&points), 1.0);
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    if intercept <= 0.0 || slope < 0.0 {
        return (median_dispersion(&points), slope.max(0.0));
    }
    (intercept, slope)
}

/// `log2((1 + e + 2aq + 2 sqrt(aq (1 + e + aq))) / (4a))`
pub fn vst_value(q: f64, asymptotic_dispersion: f64, extra_poisson: f64) -> f64 {
    let a = asymptotic_dispersion;
    let e = extra_poisson;
    let numerator = 1.0 + e + 2.0 * a * q + 2.0 * (a * q * (1.0 + e + a * q)).sqrt();
    (numerator / (4.0 * a)).log2()
}

/// Size-factor normalization followed by the parametric VST.
pub fn variance_stabilize(
    counts: &ExpressionMatrix,
) -> Result<(ExpressionMatrix, NormalizationSummary)> {
    let size_factors = estimate_size_factors(counts.values.view())?;
    let mut normalized = counts.values.clone();
    for (mut column, &sf) in normalized.axis_iter_mut(Axis(1)).zip(size_factors.iter()) {
        column.mapv_inplace(|c| c / sf);
    }

    let (asymptotic_dispersion, extra_poisson) = fit_dispersion_trend(&normalized);
    debug!(
        "Dispersion trend: asymptotic {:.4}, extra Poisson {:.4}",
        asymptotic_dispersion, extra_poisson
    );

    normalized.mapv_inplace(|q| vst_value(q, asymptotic_dispersion, extra_poisson));

    info!(
        "Normalized {} genes x {} samples (size factors {:.3}..{:.3})",
        counts.n_genes(),
        counts.n_samples(),
        size_factors.iter().copied().fold(f64::INFINITY, f64::min),
        size_factors.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    );

    let matrix = counts.with_values(normalized)?;
    Ok((
        matrix,
        NormalizationSummary {
            size_factors: size_factors.to_vec(),
            asymptotic_dispersion,
            extra_poisson,
        },
    ))
}
