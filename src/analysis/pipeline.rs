use std::path::Path;

use log::{info, warn};
use serde::Serialize;
use strum::IntoEnumIterator;

use crate::analysis::cohort::{build_cohort, CohortReport};
use crate::analysis::concordance::{concordance, ConcordanceSummary};
use crate::analysis::differential_expression::{differential_expression, GeneStatisticTable};
use crate::analysis::enrichment_analysis::{
    EnrichmentAnalysis, IdentifierResolution, OverrepresentationReport,
};
use crate::analysis::gene_set_enrichment::{rank_enrichment, RankEnrichmentReport};
use crate::analysis::length_bias::BiasCovariate;
use crate::analysis::normalization::{variance_stabilize, NormalizationSummary};
use crate::analysis::rank_aggregation::{aggregate_ranks, CombinedGeneTable};
use crate::analysis::write_results::{
    pathway_gene_map, prepare_output_dir, write_combined_table, write_gene_statistics, write_json,
    write_main_pathways, write_overrepresentation, write_rank_enrichment, COHORT_REPORT_FILE,
    COMBINED_TABLE_FILE, CONCORDANCE_FILE, GSEA_FILE, GSEA_MAIN_FILE, ORA_FILE, PATHWAY_GENES_FILE,
    RUN_CONFIG_FILE,
};
use crate::parsers::annotation_parser::GeneAnnotation;
use crate::parsers::expression_parser::ExpressionMatrix;
use crate::parsers::pathway_parser::PathwayDatabase;
use crate::parsers::response_parser::ResponseRecord;
use crate::utils::config::{PipelineConfig, ResponseMetric};
use crate::utils::error::Result;

pub struct PipelineOutputs {
    /// Input annotation with symbols from the expression matrix filled in.
    pub annotation: GeneAnnotation,
    pub cohort_report: CohortReport,
    pub normalization: Option<NormalizationSummary>,
    pub potency: GeneStatisticTable,
    pub auc: GeneStatisticTable,
    pub combined: CombinedGeneTable,
    pub significant_genes: Vec<String>,
    pub overrepresentation: OverrepresentationReport,
    pub rank_enrichment: RankEnrichmentReport,
    pub concordance: ConcordanceSummary,
}

impl PipelineOutputs {
    pub fn statistics(&self, metric: ResponseMetric) -> &GeneStatisticTable {
        match metric {
            ResponseMetric::Potency => &self.potency,
            ResponseMetric::Auc => &self.auc,
        }
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    cohort: &'a CohortReport,
    normalization: Option<&'a NormalizationSummary>,
    significant_genes: usize,
    overrepresentation_universe: usize,
    overrepresentation_covariate: BiasCovariate,
    overrepresentation_resolution: &'a IdentifierResolution,
    rank_enrichment_metric: ResponseMetric,
    rank_enrichment_resolution: &'a IdentifierResolution,
}

fn effective_covariate(
    combined: &CombinedGeneTable,
    annotation: &GeneAnnotation,
    requested: BiasCovariate,
) -> BiasCovariate {
    if requested == BiasCovariate::GeneLength
        && !combined.genes.iter().any(|g| annotation.length(&g.gene_id).is_some())
    {
        warn!("No gene lengths available; weighting by mean expression instead");
        return BiasCovariate::MeanExpression;
    }
    requested
}

/// Runs every stage from normalization to concordance.
pub fn run_pipeline(
    expression: &ExpressionMatrix,
    responses: &[ResponseRecord],
    annotation: &GeneAnnotation,
    pathways: &dyn PathwayDatabase,
    config: &PipelineConfig,
) -> Result<PipelineOutputs> {
    config.validate()?;

    let mut annotation = annotation.clone();
    if let Some(symbols) = &expression.gene_symbols {
        let added = annotation.fill_missing_symbols(
            expression
                .gene_ids
                .iter()
                .map(String::as_str)
                .zip(symbols.iter().map(String::as_str)),
        );
        if added > 0 {
            info!("Took {} gene symbols from the expression matrix", added);
        }
    }

    let (normalized, normalization) = if config.normalized_input {
        info!("Expression input is already normalized; skipping normalization");
        (expression.clone(), None)
    } else {
        let (normalized, summary) = variance_stabilize(expression)?;
        (normalized, Some(summary))
    };

    let cohort = build_cohort(&normalized, responses, &annotation, config)?;
    let potency = differential_expression(&cohort, ResponseMetric::Potency, config)?;
    let auc = differential_expression(&cohort, ResponseMetric::Auc, config)?;

    let combined = aggregate_ranks(&potency, &auc)?;
    let significant = combined.significant_ids(config.min_abs_effect, config.significant_max_padj);
    let mut significant_genes: Vec<String> = significant.iter().map(|id| id.to_string()).collect();
    significant_genes.sort_unstable();
    info!("{} genes pass the combined significance filter", significant_genes.len());

    let mut analysis = EnrichmentAnalysis::from_config(config);
    analysis.covariate = effective_covariate(&combined, &annotation, config.bias_covariate);
    let overrepresentation = analysis.run(&combined, &significant, pathways, &annotation);

    let ranked_stats = match config.gsea_metric {
        ResponseMetric::Potency => &potency,
        ResponseMetric::Auc => &auc,
    };
    let rank_enrichment = rank_enrichment(ranked_stats, pathways, &annotation, config)?;

    let concordance = concordance(
        &overrepresentation.results,
        &rank_enrichment.results,
        config.top_k,
        config.alpha,
    )?;

    Ok(PipelineOutputs {
        annotation,
        cohort_report: cohort.report,
        normalization,
        potency,
        auc,
        combined,
        significant_genes,
        overrepresentation,
        rank_enrichment,
        concordance,
    })
}

/// Writes every artifact into `out_dir`, replacing those of a previous run.
pub fn write_outputs(
    outputs: &PipelineOutputs,
    pathways: &dyn PathwayDatabase,
    config: &PipelineConfig,
    out_dir: &Path,
) -> Result<()> {
    prepare_output_dir(out_dir)?;
    let annotation = &outputs.annotation;

    for metric in ResponseMetric::iter() {
        write_gene_statistics(
            outputs.statistics(metric),
            annotation,
            &out_dir.join(format!("de_{}.tsv", metric)),
        )?;
    }
    write_combined_table(
        &outputs.combined,
        annotation,
        config.min_abs_effect,
        config.significant_max_padj,
        &out_dir.join(COMBINED_TABLE_FILE),
    )?;
    write_overrepresentation(&outputs.overrepresentation.results, &out_dir.join(ORA_FILE))?;
    write_rank_enrichment(&outputs.rank_enrichment.results, &out_dir.join(GSEA_FILE))?;
    write_main_pathways(&outputs.rank_enrichment.main_pathways, &out_dir.join(GSEA_MAIN_FILE))?;

    let significant_ids = outputs
        .overrepresentation
        .significant(config.alpha)
        .into_iter()
        .map(|r| r.pathway_id.as_str())
        .chain(
            outputs
                .rank_enrichment
                .significant(config.alpha)
                .into_iter()
                .map(|r| r.pathway_id.as_str()),
        );
    write_json(&pathway_gene_map(significant_ids, pathways), &out_dir.join(PATHWAY_GENES_FILE))?;

    write_json(&outputs.concordance, &out_dir.join(CONCORDANCE_FILE))?;
    let report = RunReport {
        cohort: &outputs.cohort_report,
        normalization: outputs.normalization.as_ref(),
        significant_genes: outputs.significant_genes.len(),
        overrepresentation_universe: outputs.overrepresentation.universe_size,
        overrepresentation_covariate: outputs.overrepresentation.covariate,
        overrepresentation_resolution: &outputs.overrepresentation.resolution,
        rank_enrichment_metric: outputs.rank_enrichment.metric,
        rank_enrichment_resolution: &outputs.rank_enrichment.resolution,
    };
    write_json(&report, &out_dir.join(COHORT_REPORT_FILE))?;
    write_json(config, &out_dir.join(RUN_CONFIG_FILE))?;

    info!("Results written to {}", out_dir.display());
    Ok(())
}
