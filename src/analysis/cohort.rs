use log::{info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::parsers::annotation_parser::GeneAnnotation;
use crate::parsers::expression_parser::ExpressionMatrix;
use crate::parsers::response_parser::ResponseRecord;
use crate::utils::config::{PipelineConfig, ResponseMetric};
use crate::utils::error::{PipelineError, Result};
use crate::utils::identifiers::{normalize_sample_id, normalize_tissue};
use crate::utils::statistics::quantile_type7;

/// Expression and response records over the same samples in the same order.
#[derive(Debug, Clone)]
pub struct Cohort {
    pub expression: ExpressionMatrix,
    pub records: Vec<ResponseRecord>,
    pub report: CohortReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CohortReport {
    pub expression_samples: usize,
    pub response_records: usize,
    pub duplicate_expression_ids: usize,
    pub duplicate_response_ids: usize,
    pub joined: usize,
    pub unmatched_expression: Vec<String>,
    pub unmatched_response: Vec<String>,
    pub after_tissue_filter: usize,
    pub lower_cut: f64,
    pub upper_cut: f64,
    pub after_extremity_filter: usize,
    pub excluded: Vec<String>,
    pub final_size: usize,
    pub marker_gene: Option<String>,
    pub marker_found: bool,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn metric_values(&self, metric: ResponseMetric) -> Vec<f64> {
        self.records.iter().map(|r| r.metric(metric)).collect()
    }
}

/// Fails on the first position where the expression column and the record
/// disagree.
pub fn verify_alignment(
    expression: &ExpressionMatrix,
    records: &[ResponseRecord],
    stage: &'static str,
) -> Result<()> {
    if expression.n_samples() != records.len() {
        return Err(PipelineError::AlignmentMismatch {
            stage,
            position: expression.n_samples().min(records.len()),
        });
    }
    match expression
        .sample_ids
        .iter()
        .zip(records)
        .position(|(column, record)| *column != record.sample_id)
    {
        Some(position) => Err(PipelineError::AlignmentMismatch { stage, position }),
        None => Ok(()),
    }
}

fn first_occurrence<'a, I>(ids: I) -> (FxHashMap<String, usize>, usize)
where
    I: Iterator<Item = &'a str>,
{
    let mut index = FxHashMap::default();
    let mut duplicates = 0;
    for (i, raw) in ids.enumerate() {
        let id = normalize_sample_id(raw);
        if index.contains_key(&id) {
            duplicates += 1;
        } else {
            index.insert(id, i);
        }
    }
    (index, duplicates)
}

fn subset(
    cohort_ids: &[String],
    records: &FxHashMap<String, ResponseRecord>,
    keep: impl Fn(&ResponseRecord) -> bool,
) -> Vec<String> {
    cohort_ids
        .iter()
        .filter(|id| records.get(*id).map_or(false, &keep))
        .cloned()
        .collect()
}

/// Joins expression and response on normalized ids and applies the tissue,
/// extremity and denylist filters in that order.
pub fn build_cohort(
    matrix: &ExpressionMatrix,
    records: &[ResponseRecord],
    annotation: &GeneAnnotation,
    config: &PipelineConfig,
) -> Result<Cohort> {
    let mut report = CohortReport {
        expression_samples: matrix.n_samples(),
        response_records: records.len(),
        marker_gene: config.marker_gene.clone(),
        ..Default::default()
    };

    let (expression_index, duplicate_expression_ids) =
        first_occurrence(matrix.sample_ids.iter().map(String::as_str));
    let (response_index, duplicate_response_ids) =
        first_occurrence(records.iter().map(|r| r.cell_line.as_str()));
    report.duplicate_expression_ids = duplicate_expression_ids;
    report.duplicate_response_ids = duplicate_response_ids;
    if duplicate_expression_ids + duplicate_response_ids > 0 {
        warn!(
            "Duplicate sample ids: {} in expression, {} in response (first kept)",
            duplicate_expression_ids, duplicate_response_ids
        );
    }

    let keyed_records: FxHashMap<String, ResponseRecord> = response_index
        .iter()
        .map(|(id, &i)| {
            let mut record = records[i].clone();
            record.sample_id = id.clone();
            (id.clone(), record)
        })
        .collect();

    let mut joined: Vec<String> = expression_index
        .keys()
        .filter(|id| keyed_records.contains_key(*id))
        .cloned()
        .collect();
    joined.sort_unstable();

    report.unmatched_expression = expression_index
        .keys()
        .filter(|id| !keyed_records.contains_key(*id))
        .cloned()
        .collect();
    report.unmatched_expression.sort_unstable();
    report.unmatched_response = keyed_records
        .keys()
        .filter(|id| !expression_index.contains_key(*id))
        .cloned()
        .collect();
    report.unmatched_response.sort_unstable();
    report.joined = joined.len();

    if joined.is_empty() {
        return Err(PipelineError::EmptyJoin {
            stage: "expression/response join",
        });
    }
    info!(
        "Joined {} samples ({} expression-only, {} response-only)",
        joined.len(),
        report.unmatched_expression.len(),
        report.unmatched_response.len()
    );

    let tissues: FxHashSet<String> = config.tissues.iter().map(|t| normalize_tissue(t)).collect();
    let in_tissues = subset(&joined, &keyed_records, |r| {
        r.tissue.as_ref().map_or(false, |t| tissues.contains(&normalize_tissue(t)))
    });
    report.after_tissue_filter = in_tissues.len();
    if in_tissues.is_empty() {
        return Err(PipelineError::EmptyJoin { stage: "tissue filter" });
    }

    let auc_values: Vec<f64> = in_tissues
        .iter()
        .filter_map(|id| keyed_records.get(id).map(|r| r.auc))
        .collect();
    let lower_cut = quantile_type7(&auc_values, config.lower_percentile);
    let upper_cut = quantile_type7(&auc_values, config.upper_percentile);
    report.lower_cut = lower_cut;
    report.upper_cut = upper_cut;

    let extremes = subset(&in_tissues, &keyed_records, |r| r.auc < lower_cut || r.auc > upper_cut);
    report.after_extremity_filter = extremes.len();
    if extremes.is_empty() {
        return Err(PipelineError::EmptyJoin { stage: "extremity filter" });
    }

    let denylist: FxHashSet<String> = config
        .excluded_samples
        .iter()
        .map(|s| normalize_sample_id(s))
        .collect();
    let (kept, excluded): (Vec<String>, Vec<String>) =
        extremes.into_iter().partition(|id| !denylist.contains(id));
    report.excluded = excluded;
    if kept.is_empty() {
        return Err(PipelineError::EmptyJoin { stage: "denylist" });
    }

    let columns: Vec<usize> = kept
        .iter()
        .map(|id| {
            expression_index
                .get(id)
                .copied()
                .ok_or(PipelineError::AlignmentMismatch { stage: "column lookup", position: 0 })
        })
        .collect::<Result<_>>()?;
    let expression = matrix.select_columns(&columns, kept.clone())?;

    let mut cohort_records: Vec<ResponseRecord> = kept
        .iter()
        .filter_map(|id| keyed_records.get(id).cloned())
        .collect();

    let marker_row = config
        .marker_gene
        .as_deref()
        .and_then(|marker| expression.find_gene(marker, annotation));
    report.marker_found = marker_row.is_some();
    match (marker_row, config.marker_gene.as_deref()) {
        (Some(row), _) => {
            for (record, &value) in cohort_records.iter_mut().zip(expression.gene_row(row).iter()) {
                record.marker_expression = Some(value);
            }
        }
        (None, Some(marker)) => warn!("Marker gene {} not found; covariate left empty", marker),
        (None, None) => {}
    }

    verify_alignment(&expression, &cohort_records, "cohort construction")?;
    report.final_size = cohort_records.len();

    info!(
        "Cohort: {} after tissue filter, {} outside AUC cuts [{:.3}, {:.3}], {} after denylist",
        report.after_tissue_filter,
        report.after_extremity_filter,
        lower_cut,
        upper_cut,
        report.final_size
    );

    Ok(Cohort {
        expression,
        records: cohort_records,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn record(name: &str, auc: f64) -> ResponseRecord {
        ResponseRecord::new(name, None, 10.0 - auc, auc)
    }

    fn fixture() -> (ExpressionMatrix, Vec<ResponseRecord>, PipelineConfig) {
        let names = [
            "L1_LUNG", "L2_LUNG", "L3_LUNG", "L4_LUNG", "L5_LUNG", "L6_LUNG", "B1_BREAST",
        ];
        let sample_ids: Vec<String> = names
            .iter()
            .map(|n| n.to_lowercase().replace('_', "-"))
            .collect();
        let values = Array2::from_shape_fn((2, names.len()), |(g, s)| (g * 10 + s) as f64);
        let matrix = ExpressionMatrix::new(
            vec!["ENSG1.1".into(), "ENSG2.1".into()],
            Some(vec!["ABL1".into(), "SRC".into()]),
            sample_ids,
            values,
        )
        .unwrap();

        let records = vec![
            record("L6_LUNG", 6.0),
            record("L1_LUNG", 1.0),
            record("L2_LUNG", 2.0),
            record("L3_LUNG", 3.0),
            record("L4_LUNG", 4.0),
            record("L5_LUNG", 5.0),
            record("B1_BREAST", 9.0),
            record("Z9_LUNG", 7.0),
        ];
        let config = PipelineConfig {
            tissues: vec!["lung".to_string()],
            marker_gene: Some("SRC".to_string()),
            ..Default::default()
        };
        (matrix, records, config)
    }

    #[test]
    fn builds_sorted_aligned_cohort_of_extremes() {
        let (matrix, records, config) = fixture();
        let cohort = build_cohort(&matrix, &records, &GeneAnnotation::default(), &config).unwrap();

        let ids: Vec<&str> = cohort.records.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["L1LUNG", "L2LUNG", "L5LUNG", "L6LUNG"]);
        assert_eq!(cohort.expression.sample_ids, ids);
        assert_eq!(cohort.report.joined, 7);
        assert_eq!(cohort.report.after_tissue_filter, 6);
        assert_eq!(cohort.report.unmatched_response, vec!["Z9LUNG"]);
        assert!(cohort.report.marker_found);
        assert_eq!(cohort.records[0].marker_expression, Some(10.0));
        assert_eq!(cohort.expression.values[[0, 3]], 5.0);
    }

    #[test]
    fn denylist_drops_normalized_ids() {
        let (matrix, records, mut config) = fixture();
        config.excluded_samples = vec!["l2-lung".to_string()];
        let cohort = build_cohort(&matrix, &records, &GeneAnnotation::default(), &config).unwrap();
        assert_eq!(cohort.report.excluded, vec!["L2LUNG"]);
        assert_eq!(cohort.len(), 3);
        assert_eq!(cohort.expression.n_samples(), 3);
    }

    #[test]
    fn repeated_builds_are_identical_regardless_of_input_order() {
        let (matrix, records, config) = fixture();
        let annotation = GeneAnnotation::default();
        let first = build_cohort(&matrix, &records, &annotation, &config).unwrap();
        let second = build_cohort(&matrix, &records, &annotation, &config).unwrap();

        let mut reversed = records.clone();
        reversed.reverse();
        let third = build_cohort(&matrix, &reversed, &annotation, &config).unwrap();

        assert_eq!(first.records, second.records);
        assert_eq!(first.records, third.records);
        assert_eq!(first.expression.sample_ids, third.expression.sample_ids);
        assert_eq!(first.expression.values, third.expression.values);
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence_and_are_counted() {
        let sample_ids: Vec<String> =
            ["X22RV1_LUNG", "22Rv1-lung", "A1_LUNG", "A2_LUNG", "A3_LUNG"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        let values = Array2::from_shape_fn((2, sample_ids.len()), |(g, s)| (g * 10 + s) as f64);
        let matrix = ExpressionMatrix::new(
            vec!["ENSG1.1".into(), "ENSG2.1".into()],
            Some(vec!["ABL1".into(), "SRC".into()]),
            sample_ids,
            values,
        )
        .unwrap();
        let records = vec![
            record("22RV1_LUNG", 1.0),
            record("A1_LUNG", 2.0),
            record("A2_LUNG", 3.0),
            record("A3_LUNG", 4.0),
            record("22rv1_Lung", 9.0),
        ];
        let config = PipelineConfig {
            tissues: vec!["LUNG".to_string()],
            marker_gene: Some("SRC".to_string()),
            ..Default::default()
        };

        let cohort = build_cohort(&matrix, &records, &GeneAnnotation::default(), &config).unwrap();
        assert_eq!(cohort.report.duplicate_expression_ids, 1);
        assert_eq!(cohort.report.duplicate_response_ids, 1);
        assert_eq!(cohort.report.joined, 4);

        let ids: Vec<&str> = cohort.records.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["22RV1LUNG", "A2LUNG", "A3LUNG"]);
        assert_eq!(cohort.records[0].auc, 1.0);
        assert_eq!(cohort.expression.values[[0, 0]], 0.0);
        assert_eq!(cohort.records[0].marker_expression, Some(10.0));
    }

    #[test]
    fn samples_on_a_cut_are_not_extreme() {
        let (matrix, records, mut config) = fixture();
        config.lower_percentile = 0.0;
        let cohort = build_cohort(&matrix, &records, &GeneAnnotation::default(), &config).unwrap();
        assert_eq!(cohort.report.lower_cut, 1.0);
        let ids: Vec<&str> = cohort.records.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["L5LUNG", "L6LUNG"]);

        let (matrix, records, mut config) = fixture();
        config.upper_percentile = 1.0;
        let cohort = build_cohort(&matrix, &records, &GeneAnnotation::default(), &config).unwrap();
        assert_eq!(cohort.report.upper_cut, 6.0);
        let ids: Vec<&str> = cohort.records.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["L1LUNG", "L2LUNG"]);
    }

    #[test]
    fn empty_join_is_fatal() {
        let (matrix, _, config) = fixture();
        let records = vec![record("NOPE_LUNG", 1.0)];
        assert!(matches!(
            build_cohort(&matrix, &records, &GeneAnnotation::default(), &config),
            Err(PipelineError::EmptyJoin { stage: "expression/response join" })
        ));
    }

    #[test]
    fn detects_misaligned_records() {
        let (matrix, records, _) = fixture();
        let mut shuffled: Vec<ResponseRecord> = records[..7].to_vec();
        for (r, id) in shuffled.iter_mut().zip(&matrix.sample_ids) {
            r.sample_id = id.clone();
        }
        assert!(verify_alignment(&matrix, &shuffled, "test").is_ok());
        shuffled.swap(0, 1);
        assert!(matches!(
            verify_alignment(&matrix, &shuffled, "test"),
            Err(PipelineError::AlignmentMismatch { position: 0, .. })
        ));
    }
}
