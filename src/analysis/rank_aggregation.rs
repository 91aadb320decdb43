use log::info;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::analysis::differential_expression::{GeneStatistic, GeneStatisticTable};
use crate::utils::config::ResponseMetric;
use crate::utils::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricStatistic {
    pub effect_size: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub rank: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedGene {
    pub gene_id: String,
    pub average_expression: f64,
    pub potency: Option<MetricStatistic>,
    pub auc: Option<MetricStatistic>,
    /// Product of the effect signs; `None` when a metric is missing.
    pub direction_sign: Option<i8>,
    pub average_rank: f64,
    pub combined_rank: f64,
}

impl CombinedGene {
    pub fn metric(&self, metric: ResponseMetric) -> Option<&MetricStatistic> {
        match metric {
            ResponseMetric::Potency => self.potency.as_ref(),
            ResponseMetric::Auc => self.auc.as_ref(),
        }
    }

    /// Concordant direction and a strong effect under both metrics.
    pub fn is_significant(&self, min_abs_effect: f64, max_adjusted_p: Option<f64>) -> bool {
        let (Some(potency), Some(auc)) = (&self.potency, &self.auc) else {
            return false;
        };
        let passes_p = max_adjusted_p.map_or(true, |ceiling| {
            potency.adjusted_p_value < ceiling && auc.adjusted_p_value < ceiling
        });
        self.direction_sign == Some(1)
            && potency.effect_size.abs() > min_abs_effect
            && auc.effect_size.abs() > min_abs_effect
            && passes_p
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CombinedGeneTable {
    pub genes: Vec<CombinedGene>,
}

impl CombinedGeneTable {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn significant_subset(
        &self,
        min_abs_effect: f64,
        max_adjusted_p: Option<f64>,
    ) -> Vec<&CombinedGene> {
        self.genes
            .iter()
            .filter(|g| g.is_significant(min_abs_effect, max_adjusted_p))
            .collect()
    }

    pub fn significant_ids(
        &self,
        min_abs_effect: f64,
        max_adjusted_p: Option<f64>,
    ) -> FxHashSet<&str> {
        self.significant_subset(min_abs_effect, max_adjusted_p)
            .into_iter()
            .map(|g| g.gene_id.as_str())
            .collect()
    }
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

pub fn direction_sign(first: f64, second: f64) -> i8 {
    sign(first) * sign(second)
}

/// 1-based ranks; tied values share the mean of the positions they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let shared = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = shared;
        }
        start = end;
    }
    ranks
}

fn metric_ranks(table: &GeneStatisticTable) -> FxHashMap<&str, (&GeneStatistic, f64)> {
    let adjusted: Vec<f64> = table.rows.iter().map(|r| r.adjusted_p_value).collect();
    let ranks = average_ranks(&adjusted);
    table
        .rows
        .iter()
        .zip(ranks)
        .map(|(row, rank)| (row.gene_id.as_str(), (row, rank)))
        .collect()
}

fn to_metric(entry: Option<&(&GeneStatistic, f64)>) -> Option<MetricStatistic> {
    entry.map(|(row, rank)| MetricStatistic {
        effect_size: row.effect_size,
        t_statistic: row.t_statistic,
        p_value: row.p_value,
        adjusted_p_value: row.adjusted_p_value,
        rank: *rank,
    })
}

/// Outer join of the two per-metric tables with average and combined ranks.
pub fn aggregate_ranks(
    potency: &GeneStatisticTable,
    auc: &GeneStatisticTable,
) -> Result<CombinedGeneTable> {
    if potency.metric != ResponseMetric::Potency || auc.metric != ResponseMetric::Auc {
        return Err(PipelineError::InvalidConfig(format!(
            "rank aggregation expects potency and auc tables, got {} and {}",
            potency.metric, auc.metric
        )));
    }

    let potency_ranks = metric_ranks(potency);
    let auc_ranks = metric_ranks(auc);
    let potency_missing = (potency.len() + 1) as f64;
    let auc_missing = (auc.len() + 1) as f64;

    let mut gene_ids: Vec<&str> = potency_ranks.keys().chain(auc_ranks.keys()).copied().collect();
    gene_ids.sort_unstable();
    gene_ids.dedup();

    let mut genes: Vec<CombinedGene> = gene_ids
        .into_iter()
        .map(|gene_id| {
            let p = potency_ranks.get(gene_id);
            let a = auc_ranks.get(gene_id);
            let potency_stat = to_metric(p);
            let auc_stat = to_metric(a);

            let direction = match (&potency_stat, &auc_stat) {
                (Some(ps), Some(as_)) => Some(direction_sign(ps.effect_size, as_.effect_size)),
                _ => None,
            };
            let average_rank = (potency_stat.as_ref().map_or(potency_missing, |s| s.rank)
                + auc_stat.as_ref().map_or(auc_missing, |s| s.rank))
                / 2.0;
            let average_expression = p
                .map(|(row, _)| row.average_expression)
                .or_else(|| a.map(|(row, _)| row.average_expression))
                .unwrap_or(f64::NAN);

            CombinedGene {
                gene_id: gene_id.to_string(),
                average_expression,
                potency: potency_stat,
                auc: auc_stat,
                direction_sign: direction,
                average_rank,
                combined_rank: 0.0,
            }
        })
        .collect();

    let averages: Vec<f64> = genes.iter().map(|g| g.average_rank).collect();
    for (gene, rank) in genes.iter_mut().zip(average_ranks(&averages)) {
        gene.combined_rank = rank;
    }
    genes.sort_by(|a, b| {
        a.average_rank
            .total_cmp(&b.average_rank)
            .then_with(|| a.gene_id.cmp(&b.gene_id))
    });

    let concordant = genes.iter().filter(|g| g.direction_sign == Some(1)).count();
    info!(
        "Combined {} genes ({} with concordant direction across metrics)",
        genes.len(),
        concordant
    );
    Ok(CombinedGeneTable { genes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::moderation::VariancePrior;

    fn row(gene: &str, effect: f64, adjusted: f64) -> GeneStatistic {
        GeneStatistic {
            gene_id: gene.to_string(),
            effect_size: effect,
            average_expression: 5.0,
            t_statistic: effect * 3.0,
            p_value: adjusted / 2.0,
            adjusted_p_value: adjusted,
        }
    }

    fn table(metric: ResponseMetric, rows: Vec<GeneStatistic>) -> GeneStatisticTable {
        GeneStatisticTable {
            metric,
            rows,
            prior: VariancePrior::none(),
            residual_df: 6.0,
            n_resistant: 4,
            n_sensitive: 4,
        }
    }

    fn fixture() -> CombinedGeneTable {
        let potency = table(
            ResponseMetric::Potency,
            vec![
                row("A", 2.5, 0.001),
                row("B", -1.5, 0.01),
                row("C", 1.2, 0.01),
                row("D", 0.0, 0.5),
                row("E", 3.0, 0.02),
            ],
        );
        let auc = table(
            ResponseMetric::Auc,
            vec![
                row("A", 2.0, 0.002),
                row("B", 1.8, 0.02),
                row("C", 0.8, 0.03),
                row("D", 1.5, 0.4),
                row("F", 2.0, 0.04),
            ],
        );
        aggregate_ranks(&potency, &auc).unwrap()
    }

    #[test]
    fn average_ranks_share_tied_positions() {
        assert_eq!(average_ranks(&[0.3, 0.1, 0.3, 0.2]), vec![3.5, 1.0, 3.5, 2.0]);
        assert_eq!(average_ranks(&[]), Vec::<f64>::new());
    }

    #[test]
    fn direction_sign_is_the_product_of_effect_signs() {
        let combined = fixture();
        for gene in &combined.genes {
            match (&gene.potency, &gene.auc) {
                (Some(p), Some(a)) => assert_eq!(
                    gene.direction_sign,
                    Some(direction_sign(p.effect_size, a.effect_size))
                ),
                _ => assert_eq!(gene.direction_sign, None),
            }
        }
        let d = combined.genes.iter().find(|g| g.gene_id == "D").unwrap();
        assert_eq!(d.direction_sign, Some(0));
    }

    #[test]
    fn significant_subset_requires_every_condition() {
        let combined = fixture();
        let ids: Vec<&str> = combined
            .significant_subset(1.0, None)
            .iter()
            .map(|g| g.gene_id.as_str())
            .collect();
        assert_eq!(ids, vec!["A"]);

        for gene in combined.significant_subset(1.0, None) {
            let p = gene.potency.as_ref().unwrap();
            let a = gene.auc.as_ref().unwrap();
            assert!(p.effect_size.abs() > 1.0 && a.effect_size.abs() > 1.0);
            assert_eq!(gene.direction_sign, Some(1));
        }
        assert!(combined.significant_subset(1.0, Some(0.001)).is_empty());
    }

    #[test]
    fn missing_metric_gets_trailing_rank() {
        let combined = fixture();
        let e = combined.genes.iter().find(|g| g.gene_id == "E").unwrap();
        assert!(e.auc.is_none());
        assert_eq!(e.average_rank, (e.potency.as_ref().unwrap().rank + 6.0) / 2.0);
    }

    #[test]
    fn combined_rank_is_monotone_in_both_metrics() {
        let combined = fixture();
        for a in &combined.genes {
            for b in &combined.genes {
                let (Some(ap), Some(aa), Some(bp), Some(ba)) =
                    (&a.potency, &a.auc, &b.potency, &b.auc)
                else {
                    continue;
                };
                if ap.adjusted_p_value < bp.adjusted_p_value
                    && aa.adjusted_p_value < ba.adjusted_p_value
                {
                    assert!(a.combined_rank <= b.combined_rank, "{} vs {}", a.gene_id, b.gene_id);
                }
            }
        }
        assert_eq!(combined.genes[0].gene_id, "A");
        assert_eq!(combined.genes[0].combined_rank, 1.0);
    }

    #[test]
    fn rejects_swapped_tables() {
        let potency = table(ResponseMetric::Potency, vec![row("A", 1.0, 0.1)]);
        assert!(aggregate_ranks(&potency, &potency).is_err());
    }
}
