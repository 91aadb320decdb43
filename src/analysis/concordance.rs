use log::info;
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::analysis::enrichment_analysis::OverrepresentationResult;
use crate::analysis::gene_set_enrichment::RankEnrichmentResult;
use crate::analysis::redundancy::jaccard_index;
use crate::utils::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcordanceSummary {
    pub alpha: f64,
    pub top_k: usize,
    pub overrepresentation_significant: usize,
    pub rank_enrichment_significant: usize,
    pub top_k_intersection: usize,
    pub full_intersection: usize,
    pub jaccard_index: f64,
    pub shared_pathways: Vec<String>,
}

/// Significant pathway ids ordered by adjusted p, raw p, then id.
fn ranked_significant<'a>(
    entries: impl Iterator<Item = (&'a str, f64, f64, bool)>,
    alpha: f64,
) -> Vec<&'a str> {
    let mut significant: Vec<(&str, f64, f64)> = entries
        .filter(|&(_, _, adjusted, tested)| tested && adjusted < alpha)
        .map(|(id, p, adjusted, _)| (id, p, adjusted))
        .collect();
    significant.sort_by(|a, b| {
        a.2.total_cmp(&b.2)
            .then(a.1.total_cmp(&b.1))
            .then_with(|| a.0.cmp(b.0))
    });
    significant.into_iter().map(|(id, _, _)| id).collect()
}

pub fn concordance(
    ora: &[OverrepresentationResult],
    gsea: &[RankEnrichmentResult],
    top_k: usize,
    alpha: f64,
) -> Result<ConcordanceSummary> {
    if top_k == 0 {
        return Err(PipelineError::InvalidConfig("top_k must be at least 1".to_string()));
    }

    let ora_ranked = ranked_significant(
        ora.iter()
            .map(|r| (r.pathway_id.as_str(), r.p_value, r.adjusted_p_value, r.tested)),
        alpha,
    );
    let gsea_ranked = ranked_significant(
        gsea.iter()
            .map(|r| (r.pathway_id.as_str(), r.p_value, r.adjusted_p_value, r.tested)),
        alpha,
    );

    let ora_all: FxHashSet<&str> = ora_ranked.iter().copied().collect();
    let gsea_all: FxHashSet<&str> = gsea_ranked.iter().copied().collect();
    let ora_top: FxHashSet<&str> = ora_ranked.iter().take(top_k).copied().collect();
    let gsea_top: FxHashSet<&str> = gsea_ranked.iter().take(top_k).copied().collect();

    let mut shared: Vec<String> = ora_all
        .intersection(&gsea_all)
        .map(|id| id.to_string())
        .collect();
    shared.sort_unstable();

    let summary = ConcordanceSummary {
        alpha,
        top_k,
        overrepresentation_significant: ora_all.len(),
        rank_enrichment_significant: gsea_all.len(),
        top_k_intersection: ora_top.intersection(&gsea_top).count(),
        full_intersection: shared.len(),
        jaccard_index: jaccard_index(&ora_all, &gsea_all),
        shared_pathways: shared,
    };
    info!(
        "Concordance: {} ORA and {} GSEA significant pathways, {} shared ({} within top {})",
        summary.overrepresentation_significant,
        summary.rank_enrichment_significant,
        summary.full_intersection,
        summary.top_k_intersection,
        top_k
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ora(id: &str, adjusted: f64) -> OverrepresentationResult {
        OverrepresentationResult {
            pathway_id: id.to_string(),
            name: id.to_string(),
            n_de_in_category: 3,
            n_in_category: 10,
            expected: 1.0,
            log_odds_ratio: 1.0,
            p_value: adjusted / 2.0,
            adjusted_p_value: adjusted,
            tested: true,
            de_genes: Vec::new(),
            category_genes: Vec::new(),
        }
    }

    fn gsea(id: &str, adjusted: f64) -> RankEnrichmentResult {
        RankEnrichmentResult {
            p_value: adjusted / 2.0,
            adjusted_p_value: adjusted,
            tested: true,
            enrichment_score: 0.6,
            normalized_enrichment_score: Some(1.8),
            ..RankEnrichmentResult::untested(id, id, 20)
        }
    }

    fn fixture() -> (Vec<OverrepresentationResult>, Vec<RankEnrichmentResult>) {
        (
            vec![ora("A", 0.001), ora("B", 0.002), ora("C", 0.01), ora("D", 0.04), ora("E", 0.3)],
            vec![
                gsea("C", 0.001),
                gsea("A", 0.003),
                gsea("D", 0.02),
                gsea("F", 0.03),
                gsea("E", 0.01),
            ],
        )
    }

    #[test]
    fn counts_exact_intersections() {
        let (ora, gsea) = fixture();
        let summary = concordance(&ora, &gsea, 100, 0.05).unwrap();
        assert_eq!(summary.overrepresentation_significant, 4);
        assert_eq!(summary.rank_enrichment_significant, 5);
        assert_eq!(summary.full_intersection, 3);
        assert_eq!(summary.top_k_intersection, 3);
        assert_eq!(summary.shared_pathways, vec!["A", "C", "D"]);
        assert!((summary.jaccard_index - 3.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn top_k_restricts_to_best_ranked() {
        let (ora, gsea) = fixture();
        let summary = concordance(&ora, &gsea, 2, 0.05).unwrap();
        // ORA top 2 = {A, B}; GSEA top 2 = {C, A}
        assert_eq!(summary.top_k_intersection, 1);
        assert_eq!(summary.full_intersection, 3);
    }

    #[test]
    fn untested_pathways_never_count() {
        let (ora, mut gsea) = fixture();
        gsea[1].tested = false;
        let summary = concordance(&ora, &gsea, 100, 0.05).unwrap();
        assert_eq!(summary.full_intersection, 2);
    }

    #[test]
    fn zero_top_k_is_rejected() {
        let (ora, gsea) = fixture();
        assert!(matches!(concordance(&ora, &gsea, 0, 0.05), Err(PipelineError::InvalidConfig(_))));
    }
}
