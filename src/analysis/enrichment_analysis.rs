use clap::ValueEnum;
use fishers_exact::fishers_exact;
use itertools::Itertools;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use statrs::distribution::{DiscreteCDF, Hypergeometric};
use statrs::function::factorial::ln_binomial;
use strum_macros::Display;

use crate::analysis::length_bias::{probability_weighting, BiasCovariate};
use crate::analysis::multiple_testing_correction::{
    adjust_p_values, AdjustmentMethod, PValueAdjustable,
};
use crate::analysis::rank_aggregation::CombinedGeneTable;
use crate::parsers::annotation_parser::GeneAnnotation;
use crate::parsers::pathway_parser::PathwayDatabase;
use crate::utils::config::PipelineConfig;
use crate::utils::identifiers::strip_gene_version;

const MAX_UNRESOLVED_EXAMPLES: usize = 10;

/// `[a, b, c, d]`: labelled in category, labelled outside, unlabelled in
/// category, unlabelled outside.
pub type ContingencyTable = [usize; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverrepresentationTest {
    /// Fisher noncentral hypergeometric with the bias-weighted odds.
    Noncentral,
    /// Resampling of labelled genes in proportion to their weights.
    Sampling,
    Hypergeometric,
    Fishers,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GeneLabel {
    pub key: String,
    pub symbol: String,
}

pub fn join_symbols(genes: &[GeneLabel]) -> String {
    genes.iter().map(|g| g.symbol.as_str()).join(", ")
}

/// Genes lost while mapping into the pathway namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentifierResolution {
    pub total: usize,
    pub resolved: usize,
    pub unresolved_identifier: usize,
    pub missing_covariate: usize,
    pub duplicate_keys: usize,
    pub examples: Vec<String>,
}

impl IdentifierResolution {
    pub fn record_unresolved(&mut self, gene_id: &str) {
        self.unresolved_identifier += 1;
        if self.examples.len() < MAX_UNRESOLVED_EXAMPLES {
            self.examples.push(gene_id.to_string());
        }
    }

    pub fn log(&self, context: &str) {
        let lost = self.total - self.resolved;
        if lost > 0 {
            warn!(
                "{}: {} of {} genes unresolved \
                 ({} without pathway id, {} without covariate, {} duplicate ids)",
                context,
                lost,
                self.total,
                self.unresolved_identifier,
                self.missing_covariate,
                self.duplicate_keys
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UniverseGene {
    pub gene_id: String,
    pub label: GeneLabel,
    pub covariate: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrepresentationResult {
    pub pathway_id: String,
    pub name: String,
    pub n_de_in_category: usize,
    pub n_in_category: usize,
    pub expected: f64,
    pub log_odds_ratio: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub tested: bool,
    pub de_genes: Vec<GeneLabel>,
    pub category_genes: Vec<GeneLabel>,
}

impl PValueAdjustable for OverrepresentationResult {
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
pub struct OverrepresentationReport {
    pub test: OverrepresentationTest,
    pub covariate: BiasCovariate,
    pub universe_size: usize,
    pub n_labelled: usize,
    pub resolution: IdentifierResolution,
    pub results: Vec<OverrepresentationResult>,
}

impl OverrepresentationReport {
    pub fn significant(&self, alpha: f64) -> Vec<&OverrepresentationResult> {
        self.results
            .iter()
            .filter(|r| r.tested && r.adjusted_p_value < alpha)
            .collect()
    }
}

pub fn create_contingency_table(
    labelled_in_category: usize,
    category_size: usize,
    total_labelled: usize,
    universe_size: usize,
) -> ContingencyTable {
    let a = labelled_in_category;
    let b = total_labelled.saturating_sub(labelled_in_category);
    let c = category_size.saturating_sub(labelled_in_category);
    let d = universe_size
        .saturating_sub(category_size)
        .saturating_sub(total_labelled.saturating_sub(labelled_in_category));

    [a, b, c, d]
}

/// Haldane-corrected log odds ratio.
pub fn calculate_log_odds_ratio(counts: &ContingencyTable) -> f64 {
    let [a, b, c, d] = counts.map(|x| x as f64 + 0.5);
    ((a * d) / (b * c)).ln()
}

pub fn fishers_test(counts: &ContingencyTable) -> f64 {
    let counts_u32 = counts.map(|x| x.min(u32::MAX as usize) as u32);

    match fishers_exact(&counts_u32) {
        Ok(result) => result.greater_pvalue.min(1.0),
        Err(_) => 1.0,
    }
}

pub fn hypergeometric_test(counts: &ContingencyTable) -> f64 {
    let k = counts[0] as u64;
    let n = (counts[0] + counts[1]) as u64;
    let category = (counts[0] + counts[2]) as u64;
    let universe = counts.iter().sum::<usize>() as u64;
    if k == 0 {
        return 1.0;
    }

    match Hypergeometric::new(universe, category, n) {
        Ok(dist) => dist.sf(k - 1),
        Err(_) => 1.0,
    }
}

/// `P(X >= k)` for Fisher's noncentral hypergeometric distribution: `n`
/// draws from `m1` category and `m2` other genes with odds ratio `odds`.
pub fn noncentral_hypergeometric_upper_tail(
    k: usize,
    n: usize,
    m1: usize,
    m2: usize,
    odds: f64,
) -> f64 {
    if k == 0 {
        return 1.0;
    }
    let low = n.saturating_sub(m2);
    let high = n.min(m1);
    if k > high || n > m1 + m2 {
        return 0.0;
    }
    let log_odds = if odds > 0.0 && odds.is_finite() { odds.ln() } else { 0.0 };

    let log_terms: Vec<f64> = (low..=high)
        .map(|x| {
            ln_binomial(m1 as u64, x as u64)
                + ln_binomial(m2 as u64, (n - x) as u64)
                + x as f64 * log_odds
        })
        .collect();
    let max_term = log_terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = log_terms.iter().map(|t| (t - max_term).exp()).collect();
    let total: f64 = weights.iter().sum();
    let upper: f64 = weights[k.max(low) - low..].iter().sum();
    (upper / total).clamp(0.0, 1.0)
}

/// Fraction of weighted resamples in which each category holds at least its
/// observed number of labelled genes.
pub fn sampling_p_values(
    weights: &[f64],
    gene_categories: &[Vec<usize>],
    observed: &[usize],
    n_draws: usize,
    repeats: usize,
    seed: u64,
) -> Vec<f64> {
    let n_categories = observed.len();
    if n_draws == 0 || repeats == 0 || weights.is_empty() {
        return vec![1.0; n_categories];
    }
    let n_draws = n_draws.min(weights.len());

    let exceed = (0..repeats)
        .into_par_iter()
        .map(|r| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(r as u64));
            let mut keys: Vec<(f64, usize)> = weights
                .iter()
                .enumerate()
                .map(|(i, &w)| {
                    let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
                    (u.ln() / w, i)
                })
                .collect();
            if n_draws < keys.len() {
                keys.select_nth_unstable_by(n_draws, |a, b| b.0.total_cmp(&a.0));
            }

            let mut hits = vec![0usize; n_categories];
            for &(_, gene) in &keys[..n_draws] {
                for &category in &gene_categories[gene] {
                    hits[category] += 1;
                }
            }
            hits.iter()
                .zip(observed)
                .map(|(&h, &o)| usize::from(h >= o))
                .collect::<Vec<usize>>()
        })
        .reduce(
            || vec![0usize; n_categories],
            |mut acc, counts| {
                for (a, c) in acc.iter_mut().zip(counts) {
                    *a += c;
                }
                acc
            },
        );

    exceed
        .iter()
        .map(|&c| (c + 1) as f64 / (repeats + 1) as f64)
        .collect()
}

/// Universe of genes with a pathway identifier and a bias covariate, in
/// combined-table order.
pub fn build_universe(
    combined: &CombinedGeneTable,
    significant: &FxHashSet<&str>,
    annotation: &GeneAnnotation,
    covariate: BiasCovariate,
) -> (Vec<UniverseGene>, IdentifierResolution) {
    let mut resolution = IdentifierResolution {
        total: combined.len(),
        ..Default::default()
    };
    let mut seen_keys: FxHashSet<String> = FxHashSet::default();
    let mut universe = Vec::with_capacity(combined.len());

    for gene in &combined.genes {
        let Some(key) = annotation.pathway_key(&gene.gene_id) else {
            resolution.record_unresolved(&gene.gene_id);
            continue;
        };
        let value = match covariate {
            BiasCovariate::GeneLength => annotation.length(&gene.gene_id),
            BiasCovariate::MeanExpression => Some(gene.average_expression),
        };
        let Some(value) = value.filter(|v| v.is_finite()) else {
            resolution.missing_covariate += 1;
            continue;
        };
        if !seen_keys.insert(key.clone()) {
            resolution.duplicate_keys += 1;
            continue;
        }

        let symbol = annotation
            .symbol(&gene.gene_id)
            .unwrap_or_else(|| strip_gene_version(&gene.gene_id))
            .to_string();
        universe.push(UniverseGene {
            gene_id: gene.gene_id.clone(),
            label: GeneLabel { key, symbol },
            covariate: value,
            significant: significant.contains(gene.gene_id.as_str()),
        });
    }
    resolution.resolved = universe.len();
    (universe, resolution)
}

pub struct EnrichmentAnalysis {
    pub test_type: OverrepresentationTest,
    pub covariate: BiasCovariate,
    pub adjustment: AdjustmentMethod,
    pub bin_size: usize,
    pub repeats: usize,
    pub seed: u64,
}

impl EnrichmentAnalysis {
    pub fn new(test_type: OverrepresentationTest) -> Self {
        Self {
            test_type,
            covariate: BiasCovariate::GeneLength,
            adjustment: AdjustmentMethod::BenjaminiHochberg,
            bin_size: 200,
            repeats: 2000,
            seed: 42,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            test_type: config.ora_test,
            covariate: config.bias_covariate,
            adjustment: config.adjustment_method,
            bin_size: config.pwf_bin_size,
            repeats: config.ora_sampling_repeats,
            seed: config.seed,
        }
    }

    /// Tests every organism pathway for overrepresentation of the
    /// significant genes, correcting for the detection bias of `covariate`.
    pub fn run(
        &self,
        combined: &CombinedGeneTable,
        significant: &FxHashSet<&str>,
        pathways: &dyn PathwayDatabase,
        annotation: &GeneAnnotation,
    ) -> OverrepresentationReport {
        let (universe, resolution) =
            build_universe(combined, significant, annotation, self.covariate);
        resolution.log("Overrepresentation universe");

        let organism_pathways = pathways.organism_pathways();
        let key_index: FxHashMap<&str, usize> = universe
            .iter()
            .enumerate()
            .map(|(i, g)| (g.label.key.as_str(), i))
            .collect();

        let members: Vec<Vec<usize>> = organism_pathways
            .iter()
            .map(|pathway| {
                let mut idx: Vec<usize> = pathway
                    .genes
                    .iter()
                    .filter_map(|gene| key_index.get(gene.as_str()).copied())
                    .collect();
                idx.sort_unstable();
                idx
            })
            .collect();

        let mut gene_categories: Vec<Vec<usize>> = vec![Vec::new(); universe.len()];
        for (p, idx) in members.iter().enumerate() {
            for &g in idx {
                gene_categories[g].push(p);
            }
        }

        let labels: Vec<bool> = universe
            .iter()
            .zip(&gene_categories)
            .map(|(gene, categories)| gene.significant && !categories.is_empty())
            .collect();
        let n_labelled = labels.iter().filter(|&&l| l).count();
        let universe_size = universe.len();

        let covariates: Vec<f64> = universe.iter().map(|g| g.covariate).collect();
        let weights = probability_weighting(&covariates, &labels, self.bin_size);
        let total_weight: f64 = weights.iter().sum();

        let observed: Vec<usize> = members
            .iter()
            .map(|idx| idx.iter().filter(|&&g| labels[g]).count())
            .collect();

        let sampled = matches!(self.test_type, OverrepresentationTest::Sampling).then(|| {
            sampling_p_values(
                &weights,
                &gene_categories,
                &observed,
                n_labelled,
                self.repeats,
                self.seed,
            )
        });

        let raw: Vec<OverrepresentationResult> = organism_pathways
            .par_iter()
            .enumerate()
            .map(|(p, pathway)| {
                let idx = &members[p];
                let k = observed[p];
                let category_size = idx.len();
                let tested = category_size > 0;
                let table = create_contingency_table(k, category_size, n_labelled, universe_size);

                let p_value = if !tested {
                    1.0
                } else {
                    match self.test_type {
                        OverrepresentationTest::Fishers => fishers_test(&table),
                        OverrepresentationTest::Hypergeometric => hypergeometric_test(&table),
                        OverrepresentationTest::Sampling => sampled.as_ref().map_or(1.0, |s| s[p]),
                        OverrepresentationTest::Noncentral => {
                            let inside: f64 = idx.iter().map(|&g| weights[g]).sum();
                            let outside_count = universe_size - category_size;
                            let odds = if outside_count == 0 {
                                1.0
                            } else {
                                (inside / category_size as f64)
                                    / ((total_weight - inside) / outside_count as f64)
                            };
                            noncentral_hypergeometric_upper_tail(
                                k,
                                n_labelled,
                                category_size,
                                outside_count,
                                odds,
                            )
                        }
                    }
                };

                let expected = if universe_size > 0 {
                    n_labelled as f64 * category_size as f64 / universe_size as f64
                } else {
                    0.0
                };

                OverrepresentationResult {
                    pathway_id: pathway.id.clone(),
                    name: pathway.name.clone(),
                    n_de_in_category: k,
                    n_in_category: category_size,
                    expected,
                    log_odds_ratio: calculate_log_odds_ratio(&table),
                    p_value,
                    adjusted_p_value: p_value,
                    tested,
                    de_genes: idx
                        .iter()
                        .filter(|&&g| labels[g])
                        .map(|&g| universe[g].label.clone())
                        .collect(),
                    category_genes: idx.iter().map(|&g| universe[g].label.clone()).collect(),
                }
            })
            .collect();

        let mut results = adjust_p_values(&raw, self.adjustment);
        results.sort_by(|a, b| {
            a.adjusted_p_value
                .total_cmp(&b.adjusted_p_value)
                .then(a.p_value.total_cmp(&b.p_value))
                .then_with(|| a.pathway_id.cmp(&b.pathway_id))
        });

        info!(
            "Overrepresentation ({}): {} labelled of {} universe genes, {} pathways tested",
            self.test_type,
            n_labelled,
            universe_size,
            results.iter().filter(|r| r.tested).count()
        );

        OverrepresentationReport {
            test: self.test_type,
            covariate: self.covariate,
            universe_size,
            n_labelled,
            resolution,
            results,
        }
    }
}
