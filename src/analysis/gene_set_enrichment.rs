use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::analysis::differential_expression::GeneStatisticTable;
use crate::analysis::enrichment_analysis::{GeneLabel, IdentifierResolution};
use crate::analysis::multiple_testing_correction::{adjust_p_values, PValueAdjustable};
use crate::analysis::redundancy::{collapse_pathways, MainPathway};
use crate::parsers::annotation_parser::GeneAnnotation;
use crate::parsers::pathway_parser::PathwayDatabase;
use crate::utils::config::{PipelineConfig, ResponseMetric};
use crate::utils::error::{PipelineError, Result};
use crate::utils::identifiers::strip_gene_version;

/// Genes ordered by decreasing statistic.
#[derive(Debug, Clone, Default)]
pub struct RankedGenes {
    pub labels: Vec<GeneLabel>,
    pub scores: Vec<f64>,
}

impl RankedGenes {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Running-sum weights `|score|^p`.
    pub fn weights(&self, exponent: f64) -> Vec<f64> {
        self.scores
            .iter()
            .map(|s| if exponent == 0.0 { 1.0 } else { s.abs().powf(exponent) })
            .collect()
    }
}

/// Builds the ranked list from the moderated t statistics, keeping the first
/// occurrence of every pathway key.
pub fn rank_genes(
    table: &GeneStatisticTable,
    annotation: &GeneAnnotation,
) -> (RankedGenes, IdentifierResolution) {
    let mut resolution = IdentifierResolution {
        total: table.len(),
        ..Default::default()
    };
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut entries: Vec<(GeneLabel, f64)> = Vec::with_capacity(table.len());

    for row in &table.rows {
        let Some(key) = annotation.pathway_key(&row.gene_id) else {
            resolution.record_unresolved(&row.gene_id);
            continue;
        };
        if !row.t_statistic.is_finite() {
            resolution.missing_covariate += 1;
            continue;
        }
        if !seen.insert(key.clone()) {
            resolution.duplicate_keys += 1;
            continue;
        }
        let symbol = annotation
            .symbol(&row.gene_id)
            .unwrap_or_else(|| strip_gene_version(&row.gene_id))
            .to_string();
        entries.push((GeneLabel { key, symbol }, row.t_statistic));
    }
    resolution.resolved = entries.len();
    if resolution.duplicate_keys > 0 {
        debug!("{} duplicate gene ids dropped from the ranked list", resolution.duplicate_keys);
    }

    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.key.cmp(&b.0.key)));
    let (labels, scores) = entries.into_iter().unzip();
    (RankedGenes { labels, scores }, resolution)
}

/// Weighted Kolmogorov-Smirnov enrichment score of the sorted positions
/// `hits` in a list of `n_total` genes, with the position of its peak.
pub fn enrichment_score(hits: &[usize], weights: &[f64], n_total: usize) -> (f64, usize) {
    if hits.is_empty() || hits.len() >= n_total {
        return (0.0, 0);
    }
    let n_miss = (n_total - hits.len()) as f64;
    let hit_weight: f64 = hits.iter().map(|&i| weights[i]).sum();
    if hit_weight <= 0.0 {
        return (0.0, 0);
    }

    let mut running = 0.0;
    let (mut max_dev, mut max_at) = (0.0, hits[0]);
    let (mut min_dev, mut min_at) = (0.0, hits[0]);
    for (j, &hit) in hits.iter().enumerate() {
        let missed = (hit - j) as f64 / n_miss;

        // deviation just before and just after stepping onto the hit
        let before = running / hit_weight - missed;
        running += weights[hit];
        let after = running / hit_weight - missed;
        for deviation in [before, after] {
            if deviation > max_dev {
                max_dev = deviation;
                max_at = hit;
            }
            if deviation < min_dev {
                min_dev = deviation;
                min_at = hit;
            }
        }
    }

    if max_dev >= -min_dev {
        (max_dev, max_at)
    } else {
        (min_dev, min_at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankEnrichmentResult {
    pub pathway_id: String,
    pub name: String,
    pub size: usize,
    pub enrichment_score: f64,
    pub normalized_enrichment_score: Option<f64>,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub tested: bool,
    pub leading_edge: Vec<GeneLabel>,
}

impl RankEnrichmentResult {
    pub fn untested(pathway_id: &str, name: &str, size: usize) -> Self {
        Self {
            pathway_id: pathway_id.to_string(),
            name: name.to_string(),
            size,
            enrichment_score: 0.0,
            normalized_enrichment_score: None,
            p_value: 1.0,
            adjusted_p_value: 1.0,
            tested: false,
            leading_edge: Vec::new(),
        }
    }
}

impl PValueAdjustable for RankEnrichmentResult {
    fn extract_p_value(&self) -> f64 {
        self.p_value
    }

    fn is_tested(&self) -> bool {
        self.tested
    }

    fn with_adjusted_p_value(&self, adjusted: f64) -> Self {
        Self {
            adjusted_p_value: adjusted,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankEnrichmentReport {
    pub metric: ResponseMetric,
    pub ranked_genes: usize,
    pub resolution: IdentifierResolution,
    pub results: Vec<RankEnrichmentResult>,
    pub main_pathways: Vec<MainPathway>,
}

impl RankEnrichmentReport {
    pub fn significant(&self, alpha: f64) -> Vec<&RankEnrichmentResult> {
        self.results
            .iter()
            .filter(|r| r.tested && r.adjusted_p_value < alpha)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PermutationSettings {
    pub permutations: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub weight: f64,
    pub seed: u64,
}

#[derive(Default)]
struct NullSummary {
    as_extreme: usize,
    same_sign: usize,
    same_sign_sum: f64,
}

fn permutation_null(
    es: f64,
    size: usize,
    weights: &[f64],
    n_total: usize,
    permutations: usize,
    seed: u64,
) -> NullSummary {
    let mut summary = NullSummary::default();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pool: Vec<usize> = (0..n_total).collect();
    let mut sample = vec![0usize; size];

    for _ in 0..permutations {
        // partial Fisher-Yates draw of `size` positions
        for i in 0..size {
            let j = rng.random_range(i..n_total);
            pool.swap(i, j);
            sample[i] = pool[i];
        }
        sample.sort_unstable();
        let (null_es, _) = enrichment_score(&sample, weights, n_total);

        if es > 0.0 {
            if null_es >= 0.0 {
                summary.same_sign += 1;
                summary.same_sign_sum += null_es;
                if null_es >= es {
                    summary.as_extreme += 1;
                }
            }
        } else if null_es <= 0.0 {
            summary.same_sign += 1;
            summary.same_sign_sum += null_es;
            if null_es <= es {
                summary.as_extreme += 1;
            }
        }
    }
    summary
}

/// Scores every organism pathway against `ranked`; the permutation stream of
/// pathway `i` is seeded with `seed + i`.
pub fn score_pathways(
    ranked: &RankedGenes,
    pathways: &dyn PathwayDatabase,
    settings: PermutationSettings,
) -> Vec<RankEnrichmentResult> {
    let position: FxHashMap<&str, usize> = ranked
        .labels
        .iter()
        .enumerate()
        .map(|(i, label)| (label.key.as_str(), i))
        .collect();
    let weights = ranked.weights(settings.weight);
    let n_total = ranked.len();

    pathways
        .organism_pathways()
        .par_iter()
        .enumerate()
        .map(|(idx, pathway)| {
            let mut hits: Vec<usize> = pathway
                .genes
                .iter()
                .filter_map(|gene| position.get(gene.as_str()).copied())
                .collect();
            hits.sort_unstable();
            let size = hits.len();

            let in_range = size >= settings.min_size && size <= settings.max_size;
            if size == 0 || !in_range || size >= n_total {
                return RankEnrichmentResult::untested(&pathway.id, &pathway.name, size);
            }

            let (es, peak) = enrichment_score(&hits, &weights, n_total);
            let null = permutation_null(
                es,
                size,
                &weights,
                n_total,
                settings.permutations,
                settings.seed.wrapping_add(idx as u64),
            );

            let null_mean = if null.same_sign > 0 {
                null.same_sign_sum / null.same_sign as f64
            } else {
                0.0
            };
            let normalized = (null_mean != 0.0).then(|| es / null_mean.abs());
            let p_value = if settings.permutations == 0 {
                1.0
            } else {
                ((null.as_extreme + 1) as f64 / (null.same_sign + 1) as f64).min(1.0)
            };

            let leading_edge = hits
                .iter()
                .filter(|&&i| if es >= 0.0 { i <= peak } else { i >= peak })
                .map(|&i| ranked.labels[i].clone())
                .collect();

            RankEnrichmentResult {
                pathway_id: pathway.id.clone(),
                name: pathway.name.clone(),
                size,
                enrichment_score: es,
                normalized_enrichment_score: normalized,
                p_value,
                adjusted_p_value: p_value,
                tested: true,
                leading_edge,
            }
        })
        .collect()
}

/// Permutation-based enrichment of the configured metric's moderated t
/// statistics, with redundancy collapse of the significant pathways.
pub fn rank_enrichment(
    stats: &GeneStatisticTable,
    pathways: &dyn PathwayDatabase,
    annotation: &GeneAnnotation,
    config: &PipelineConfig,
) -> Result<RankEnrichmentReport> {
    if config.gsea_min_size > config.gsea_max_size {
        return Err(PipelineError::InvalidConfig(format!(
            "gsea min size {} exceeds max size {}",
            config.gsea_min_size, config.gsea_max_size
        )));
    }

    let (ranked, resolution) = rank_genes(stats, annotation);
    resolution.log("Ranked gene list");
    if ranked.is_empty() {
        return Err(PipelineError::EmptyJoin { stage: "ranked gene list" });
    }

    let settings = PermutationSettings {
        permutations: config.gsea_permutations,
        min_size: config.gsea_min_size,
        max_size: config.gsea_max_size,
        weight: config.gsea_weight,
        seed: config.seed,
    };
    let raw = score_pathways(&ranked, pathways, settings);
    let mut results = adjust_p_values(&raw, config.adjustment_method);
    results.sort_by(|a, b| {
        a.adjusted_p_value
            .total_cmp(&b.adjusted_p_value)
            .then(a.p_value.total_cmp(&b.p_value))
            .then_with(|| a.pathway_id.cmp(&b.pathway_id))
    });

    let main_pathways = collapse_pathways(&results, config.alpha, config.collapse_threshold);
    info!(
        "Rank enrichment on {}: {} genes ranked, {} of {} pathways tested, {} main pathways",
        stats.metric,
        ranked.len(),
        results.iter().filter(|r| r.tested).count(),
        results.len(),
        main_pathways.len()
    );

    Ok(RankEnrichmentReport {
        metric: stats.metric,
        ranked_genes: ranked.len(),
        resolution,
        results,
        main_pathways,
    })
}
