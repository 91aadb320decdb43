use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::cohort::Cohort;
use crate::analysis::moderation::{fit_variance_prior, two_sided_p_value, VariancePrior};
use crate::analysis::multiple_testing_correction::{
    adjust_p_values, AdjustmentMethod, PValueAdjustable,
};
use crate::utils::config::{PipelineConfig, ResistanceDirection, ResponseMetric};
use crate::utils::error::{PipelineError, Result};
use crate::utils::statistics::median;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneStatistic {
    pub gene_id: String,
    /// log2 difference, resistant minus sensitive.
    pub effect_size: f64,
    pub average_expression: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
}

impl PValueAdjustable for GeneStatistic {
    fn extract_p_value(&self) -> f64 {
        self.p_value
    }

    fn with_adjusted_p_value(&self, adjusted: f64) -> Self {
        Self {
            adjusted_p_value: adjusted,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneStatisticTable {
    pub metric: ResponseMetric,
    pub rows: Vec<GeneStatistic>,
    pub prior: VariancePrior,
    pub residual_df: f64,
    pub n_resistant: usize,
    pub n_sensitive: usize,
}

impl GeneStatisticTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn significant(&self, alpha: f64) -> Vec<&GeneStatistic> {
        self.rows.iter().filter(|r| r.adjusted_p_value < alpha).collect()
    }

    /// Rows ordered by p-value, ties by gene id.
    pub fn ranked(&self) -> Vec<&GeneStatistic> {
        let mut rows: Vec<&GeneStatistic> = self.rows.iter().collect();
        rows.sort_by(|a, b| {
            a.p_value
                .total_cmp(&b.p_value)
                .then_with(|| a.gene_id.cmp(&b.gene_id))
        });
        rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseGroup {
    High,
    Low,
}

/// Above the median is High; ties and below are Low.
pub fn split_by_median(values: &[f64]) -> Vec<ResponseGroup> {
    let cut = median(values);
    values
        .iter()
        .map(|&v| if v > cut { ResponseGroup::High } else { ResponseGroup::Low })
        .collect()
}

/// 1.0 for resistant samples given the metric's orientation.
pub fn resistant_indicator(groups: &[ResponseGroup], direction: ResistanceDirection) -> Vec<f64> {
    groups
        .iter()
        .map(|g| {
            if (*g == ResponseGroup::High) == direction.high_is_resistant() {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

struct GeneFit {
    coefficient: f64,
    residual_variance: f64,
    mean: f64,
}

/// Least-squares fit of every gene row on `design`, then moderated t tests
/// of coefficient `coefficient`.
pub fn fit_moderated_contrast(
    values: ArrayView2<f64>,
    gene_ids: &[String],
    design: &DMatrix<f64>,
    coefficient: usize,
    method: AdjustmentMethod,
) -> Result<(Vec<GeneStatistic>, VariancePrior, f64)> {
    let (n_samples, n_coef) = design.shape();
    if values.ncols() != n_samples || values.nrows() != gene_ids.len() || coefficient >= n_coef {
        return Err(PipelineError::InvalidConfig(format!(
            "design of {} x {} does not fit {} genes x {} samples",
            n_samples,
            n_coef,
            values.nrows(),
            values.ncols()
        )));
    }
    if n_samples <= n_coef {
        return Err(PipelineError::DegenerateDesign {
            metric: "linear model".to_string(),
            reason: format!("{} samples for {} coefficients", n_samples, n_coef),
        });
    }

    let xtx_inv = (design.transpose() * design)
        .try_inverse()
        .ok_or_else(|| PipelineError::DegenerateDesign {
            metric: "linear model".to_string(),
            reason: "design matrix is singular".to_string(),
        })?;
    let projection = &xtx_inv * design.transpose();
    let unscaled_variance = xtx_inv[(coefficient, coefficient)];
    let residual_df = (n_samples - n_coef) as f64;

    let fits: Vec<GeneFit> = (0..values.nrows())
        .into_par_iter()
        .map(|g| {
            let y = DVector::from_iterator(n_samples, values.row(g).iter().copied());
            let beta = &projection * &y;
            let residuals = &y - design * &beta;
            GeneFit {
                coefficient: beta[coefficient],
                residual_variance: residuals.norm_squared() / residual_df,
                mean: y.mean(),
            }
        })
        .collect();

    let variances: Vec<f64> = fits.iter().map(|f| f.residual_variance).collect();
    let prior = fit_variance_prior(&variances, residual_df);
    let total_df = if prior.df.is_infinite() {
        f64::INFINITY
    } else {
        (prior.df + residual_df).min(residual_df * fits.len() as f64)
    };

    let raw: Vec<GeneStatistic> = fits
        .par_iter()
        .zip(gene_ids.par_iter())
        .map(|(fit, gene_id)| {
            let posterior = prior.posterior_variance(fit.residual_variance, residual_df);
            let t = fit.coefficient / (posterior.sqrt() * unscaled_variance.sqrt());
            let (t, p) = if posterior > 0.0 && t.is_finite() {
                (t, two_sided_p_value(t, total_df))
            } else {
                (0.0, 1.0)
            };
            GeneStatistic {
                gene_id: gene_id.clone(),
                effect_size: fit.coefficient,
                average_expression: fit.mean,
                t_statistic: t,
                p_value: p,
                adjusted_p_value: p,
            }
        })
        .collect();

    Ok((adjust_p_values(&raw, method), prior, residual_df))
}

/// Moderated two-group comparison of resistant against sensitive lines for
/// one response metric.
pub fn differential_expression(
    cohort: &Cohort,
    metric: ResponseMetric,
    config: &PipelineConfig,
) -> Result<GeneStatisticTable> {
    let values = cohort.metric_values(metric);
    let groups = split_by_median(&values);
    let indicator = resistant_indicator(&groups, config.direction(metric));

    let n_resistant = indicator.iter().filter(|&&x| x > 0.5).count();
    let n_sensitive = indicator.len() - n_resistant;
    if n_resistant < 2 || n_sensitive < 2 {
        return Err(PipelineError::DegenerateDesign {
            metric: metric.to_string(),
            reason: format!(
                "{} resistant and {} sensitive samples; need at least two of each",
                n_resistant, n_sensitive
            ),
        });
    }

    let covariate: Option<Vec<f64>> = if config.adjust_for_marker {
        let values: Option<Vec<f64>> = cohort.records.iter().map(|r| r.marker_expression).collect();
        if values.is_none() {
            warn!("Marker covariate unavailable for {}; fitting without it", metric);
        }
        values
    } else {
        None
    };
    let n_coef = if covariate.is_some() { 3 } else { 2 };
    let design = DMatrix::from_fn(indicator.len(), n_coef, |i, j| match j {
        0 => 1.0,
        1 => indicator[i],
        _ => covariate.as_ref().map_or(0.0, |c| c[i]),
    });
    debug!(
        "{} design: {} samples x {} coefficients",
        metric,
        design.nrows(),
        design.ncols()
    );

    let (rows, prior, residual_df) = fit_moderated_contrast(
        cohort.expression.values.view(),
        &cohort.expression.gene_ids,
        &design,
        1,
        config.adjustment_method,
    )
    .map_err(|e| match e {
        PipelineError::DegenerateDesign { reason, .. } => PipelineError::DegenerateDesign {
            metric: metric.to_string(),
            reason,
        },
        other => other,
    })?;

    let table = GeneStatisticTable {
        metric,
        rows,
        prior,
        residual_df,
        n_resistant,
        n_sensitive,
    };
    info!(
        "{}: {} resistant vs {} sensitive, {} genes with adjusted p < {}",
        metric,
        n_resistant,
        n_sensitive,
        table.significant(config.alpha).len(),
        config.alpha
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::expression_parser::ExpressionMatrix;
    use crate::parsers::response_parser::ResponseRecord;
    use crate::analysis::cohort::CohortReport;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    const N_NOISE: usize = 20;

    fn synthetic_cohort() -> Cohort {
        // Samples 0..4 are resistant (high IC50), 4..8 sensitive.
        let mut rows: Vec<f64> = vec![7.1, 6.9, 7.2, 6.8, 5.1, 4.9, 5.2, 4.8];
        let mut gene_ids = vec!["ENGINEERED".to_string()];

        // Noise genes shift the resistant group by at most 0.2 against a
        // within-group variance of 0.3, so |t| stays well below 1.
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..N_NOISE {
            let level = rng.random_range(4.0..6.0);
            let magnitude = rng.random_range(0.02..0.2);
            let shift = if rng.random_bool(0.5) { magnitude } else { -magnitude };
            for group_shift in [shift, 0.0] {
                let mut offsets = [0.6, -0.6, 0.3, -0.3];
                offsets.shuffle(&mut rng);
                rows.extend(offsets.iter().map(|o| level + group_shift + o));
            }
            gene_ids.push(format!("NOISE{}", i + 1));
        }
        let values = Array2::from_shape_vec((gene_ids.len(), 8), rows).unwrap();

        let samples: Vec<String> = (0..8).map(|i| format!("S{}", i)).collect();
        let expression = ExpressionMatrix::new(gene_ids, None, samples.clone(), values).unwrap();
        let records = samples
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let potency = if i < 4 { 10.0 + i as f64 } else { 0.1 * (i as f64) };
                let auc = 8.0 - potency.min(8.0);
                let mut r = ResponseRecord::new(id, Some("LUNG".into()), potency, auc);
                r.sample_id = id.clone();
                r
            })
            .collect();
        Cohort {
            expression,
            records,
            report: CohortReport::default(),
        }
    }

    fn effect(table: &GeneStatisticTable, gene_id: &str) -> f64 {
        table
            .rows
            .iter()
            .find(|r| r.gene_id == gene_id)
            .map(|r| r.effect_size)
            .unwrap()
    }

    #[test]
    fn median_split_sends_ties_low() {
        let groups = split_by_median(&[1.0, 2.0, 2.0, 3.0]);
        assert_eq!(
            groups,
            vec![ResponseGroup::Low, ResponseGroup::Low, ResponseGroup::Low, ResponseGroup::High]
        );
    }

    #[test]
    fn resistant_indicator_follows_direction() {
        let groups = [ResponseGroup::High, ResponseGroup::Low];
        assert_eq!(
            resistant_indicator(&groups, ResistanceDirection::HighIsResistant),
            vec![1.0, 0.0]
        );
        assert_eq!(
            resistant_indicator(&groups, ResistanceDirection::LowIsResistant),
            vec![0.0, 1.0]
        );
    }

    #[test]
    fn engineered_gene_ranks_first_and_noise_stays_insignificant() {
        let cohort = synthetic_cohort();
        let config = PipelineConfig::default();
        let table = differential_expression(&cohort, ResponseMetric::Potency, &config).unwrap();

        assert_eq!(table.n_resistant, 4);
        assert_eq!(table.n_sensitive, 4);
        let ranked = table.ranked();
        assert_eq!(ranked[0].gene_id, "ENGINEERED");
        assert!(ranked[0].p_value < 1e-4);
        assert!((ranked[0].effect_size - 2.0).abs() < 1e-9);

        let noise: Vec<&GeneStatistic> =
            table.rows.iter().filter(|r| r.gene_id.starts_with("NOISE")).collect();
        assert_eq!(noise.len(), N_NOISE);
        for row in noise {
            assert!(row.effect_size.abs() > 0.01, "{} has no group difference", row.gene_id);
            assert!(
                row.adjusted_p_value > 0.05,
                "{} adj p {}",
                row.gene_id,
                row.adjusted_p_value
            );
        }
    }

    #[test]
    fn effects_are_oriented_resistant_minus_sensitive() {
        let cohort = synthetic_cohort();
        let config = PipelineConfig::default();
        let potency = differential_expression(&cohort, ResponseMetric::Potency, &config).unwrap();
        let auc = differential_expression(&cohort, ResponseMetric::Auc, &config).unwrap();

        let p = effect(&potency, "ENGINEERED");
        let a = effect(&auc, "ENGINEERED");
        assert!(p > 0.0);
        assert!(a > 0.0, "low AUC marks the same resistant lines");
    }

    #[test]
    fn constant_gene_gets_neutral_statistics() {
        let values = array![[3.0, 3.0, 3.0, 3.0], [1.0, 2.0, 3.0, 4.5]];
        let design = DMatrix::from_row_slice(4, 2, &[1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0]);
        let (rows, _, _) = fit_moderated_contrast(
            values.view(),
            &["FLAT".to_string(), "VARYING".to_string()],
            &design,
            1,
            AdjustmentMethod::BenjaminiHochberg,
        )
        .unwrap();
        assert!(rows[0].t_statistic.abs() < 1e-8);
        assert!((rows[0].p_value - 1.0).abs() < 1e-9);
        assert!(rows[1].t_statistic < 0.0);
    }

    #[test]
    fn too_few_samples_per_group_is_degenerate() {
        let mut cohort = synthetic_cohort();
        cohort.records.truncate(3);
        cohort.expression = cohort
            .expression
            .select_columns(&[0, 1, 2], vec!["S0".into(), "S1".into(), "S2".into()])
            .unwrap();
        assert!(matches!(
            differential_expression(&cohort, ResponseMetric::Potency, &PipelineConfig::default()),
            Err(PipelineError::DegenerateDesign { .. })
        ));
    }
}
