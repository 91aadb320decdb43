use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::analysis::enrichment_analysis::OverrepresentationTest;
use crate::analysis::length_bias::BiasCovariate;
use crate::analysis::multiple_testing_correction::AdjustmentMethod;
use crate::utils::error::{PipelineError, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseMetric {
    /// IC50-like concentration metric.
    Potency,
    /// Activity area under the dose-response curve.
    Auc,
}

/// Which end of a metric marks a resistant cell line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResistanceDirection {
    HighIsResistant,
    LowIsResistant,
}

impl ResistanceDirection {
    pub fn high_is_resistant(&self) -> bool {
        matches!(self, ResistanceDirection::HighIsResistant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseColumns {
    pub cell_line: String,
    pub compound: String,
    pub potency: String,
    pub auc: String,
    pub tissue: Option<String>,
}

impl Default for ResponseColumns {
    fn default() -> Self {
        Self {
            cell_line: "CCLE Cell Line Name".to_string(),
            compound: "Compound".to_string(),
            potency: "IC50 (uM)".to_string(),
            auc: "ActArea".to_string(),
            tissue: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub drug: String,
    pub columns: ResponseColumns,
    pub potency_direction: ResistanceDirection,
    pub auc_direction: ResistanceDirection,
    pub tissues: Vec<String>,
    pub excluded_samples: Vec<String>,
    pub marker_gene: Option<String>,
    pub adjust_for_marker: bool,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
    pub normalized_input: bool,
    pub alpha: f64,
    pub min_abs_effect: f64,
    pub significant_max_padj: Option<f64>,
    pub adjustment_method: AdjustmentMethod,
    pub ora_test: OverrepresentationTest,
    pub bias_covariate: BiasCovariate,
    pub pwf_bin_size: usize,
    pub ora_sampling_repeats: usize,
    pub gsea_metric: ResponseMetric,
    pub gsea_permutations: usize,
    pub gsea_min_size: usize,
    pub gsea_max_size: usize,
    pub gsea_weight: f64,
    pub collapse_threshold: f64,
    pub top_k: usize,
    pub seed: u64,
    pub organism: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drug: "Dasatinib".to_string(),
            columns: ResponseColumns::default(),
            potency_direction: ResistanceDirection::HighIsResistant,
            auc_direction: ResistanceDirection::LowIsResistant,
            tissues: vec![
                "HAEMATOPOIETIC_AND_LYMPHOID_TISSUE".to_string(),
                "LUNG".to_string(),
            ],
            excluded_samples: Vec::new(),
            marker_gene: Some("ABL1".to_string()),
            adjust_for_marker: false,
            lower_percentile: 0.33,
            upper_percentile: 0.66,
            normalized_input: false,
            alpha: 0.05,
            min_abs_effect: 1.0,
            significant_max_padj: None,
            adjustment_method: AdjustmentMethod::BenjaminiHochberg,
            ora_test: OverrepresentationTest::Noncentral,
            bias_covariate: BiasCovariate::GeneLength,
            pwf_bin_size: 200,
            ora_sampling_repeats: 2000,
            gsea_metric: ResponseMetric::Auc,
            gsea_permutations: 1000,
            gsea_min_size: 15,
            gsea_max_size: 500,
            gsea_weight: 1.0,
            collapse_threshold: 0.5,
            top_k: 100,
            seed: 42,
            organism: "Homo sapiens".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn direction(&self, metric: ResponseMetric) -> ResistanceDirection {
        match metric {
            ResponseMetric::Potency => self.potency_direction,
            ResponseMetric::Auc => self.auc_direction,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "alpha must lie in (0, 1), got {}",
                self.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.lower_percentile)
            || !(0.0..=1.0).contains(&self.upper_percentile)
            || self.lower_percentile > self.upper_percentile
        {
            return Err(PipelineError::InvalidConfig(format!(
                "percentile cut points must satisfy 0 <= lower <= upper <= 1, got {} and {}",
                self.lower_percentile, self.upper_percentile
            )));
        }
        if self.tissues.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one tissue type is required".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(PipelineError::InvalidConfig("top-k must be positive".to_string()));
        }
        if self.gsea_permutations == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one permutation is required".to_string(),
            ));
        }
        if self.gsea_min_size == 0 || self.gsea_min_size > self.gsea_max_size {
            return Err(PipelineError::InvalidConfig(format!(
                "gene set size bounds must satisfy 1 <= min <= max, got {} and {}",
                self.gsea_min_size, self.gsea_max_size
            )));
        }
        if self.pwf_bin_size == 0 {
            return Err(PipelineError::InvalidConfig("bin size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.collapse_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "collapse threshold must lie in [0, 1], got {}",
                self.collapse_threshold
            )));
        }
        if let Some(ceiling) = self.significant_max_padj {
            if !(ceiling > 0.0 && ceiling <= 1.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "adjusted p-value ceiling must lie in (0, 1], got {}",
                    ceiling
                )));
            }
        }
        if self.gsea_weight < 0.0 || !self.gsea_weight.is_finite() {
            return Err(PipelineError::InvalidConfig(format!(
                "enrichment weight must be a finite non-negative number, got {}",
                self.gsea_weight
            )));
        }
        if self.adjust_for_marker && self.marker_gene.is_none() {
            return Err(PipelineError::InvalidConfig(
                "marker adjustment requested without a marker gene".to_string(),
            ));
        }
        Ok(())
    }
}
